//! NAND translation layer
//!
//! Presents a flat array of logical pages on top of a [`NandDevice`] that
//! only supports erase-before-program and develops bad blocks over its life.
//!
//! - Writes go out of place to the next page of the active block; a write is
//!   durable once its page program completes.
//! - Each page's spare area holds a [`PageTag`]. Mount replays the tags in
//!   sequence order, so a page torn by power loss (CRC mismatch) is ignored
//!   and the previous mapping survives.
//! - New blocks are taken least-worn first; when the free pool shrinks to
//!   [`GC_RESERVE_BLOCKS`], the used block with the fewest live pages is
//!   evacuated and erased.
//! - A block that fails a program or erase gets the persistent bad marker
//!   and never returns to the free pool, including after replay.

mod blocks;
mod map;

pub use blocks::{BlockInfo, BlockState};
pub use map::{JournalEntry, PageTag, TagKind, TranslationMap, TAG_LEN};

use crate::error::{Result, StorageError};
use crate::nand::{Geometry, NandDevice};
use blocks::BlockTable;
use map::{decode_trim_list, encode_trim_list, trim_entries_per_page, Journal, Replay};
use std::collections::HashMap;
use std::ops::Range;
use tracing::{debug, info, warn};

/// Free blocks held back so garbage collection always has somewhere to
/// relocate live pages.
pub const GC_RESERVE_BLOCKS: u32 = 2;

const JOURNAL_WINDOW: usize = 64;

/// Logical pages exported for a chip: everything except the GC reserve, one
/// block of slack for trim records and a bad-block allowance of ~3%.
pub fn capacity_for(geometry: &Geometry) -> u32 {
    let bad_allowance = (geometry.num_blocks / 32).max(2);
    let usable = geometry
        .num_blocks
        .saturating_sub(GC_RESERVE_BLOCKS + 1 + bad_allowance);
    usable * geometry.pages_per_block()
}

/// Translation layer counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FtlStats {
    pub user_reads: u64,
    pub user_writes: u64,
    pub trimmed_pages: u64,
    pub gc_cycles: u64,
    pub relocations: u64,
    pub erases: u64,
    pub retired_blocks: u64,
    pub ecc_errors: u64,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    block: u32,
    next: u32,
}

pub struct Ftl<D: NandDevice> {
    device: D,
    geometry: Geometry,
    capacity: u32,
    map: TranslationMap,
    /// logical page -> trim record that shadows its older copies
    trims: HashMap<u32, u32>,
    /// trim record page -> number of logical pages it still shadows
    trim_refs: HashMap<u32, u32>,
    journal: Journal,
    blocks: BlockTable,
    cursor: Option<Cursor>,
    relocating: bool,
    stats: FtlStats,
}

impl<D: NandDevice> Ftl<D> {
    /// Scan the chip and rebuild the map from the on-flash journal.
    ///
    /// A blank chip mounts as an empty map.
    pub fn mount(mut device: D) -> Result<Self> {
        let geometry = device.geometry();
        geometry.validate()?;
        let capacity = capacity_for(&geometry);
        if capacity == 0 {
            return Err(StorageError::Parameter(
                "chip too small for the block reserve".into(),
            ));
        }

        let pages_per_block = geometry.pages_per_block();
        let mut blocks = BlockTable::new(geometry.num_blocks);
        let mut known_wear = vec![false; geometry.num_blocks as usize];
        let mut entries = Vec::new();
        let mut trim_lists = HashMap::new();
        let mut resume: Option<(u64, u32)> = None;

        let mut data = vec![0u8; geometry.page_size()];
        let mut spare = [0u8; TAG_LEN];

        for block in 0..geometry.num_blocks {
            if device.is_bad(block) {
                blocks.mark_bad(block);
                continue;
            }

            let first = geometry.first_page(block);
            let mut written = 0;
            let mut wear: Option<u32> = None;
            let mut newest: Option<u64> = None;

            for offset in 0..pages_per_block {
                let page = first + offset;
                if device.is_free(page) {
                    continue;
                }
                written = offset + 1;

                match device.read(page, &mut data, &mut spare) {
                    Ok(()) => {}
                    Err(StorageError::Ecc(_)) => {
                        warn!("Unreadable page {} skipped during replay", page);
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                let Some(tag) = PageTag::from_bytes(&spare) else {
                    continue;
                };
                if !tag.verify(&data) {
                    debug!("Torn page {} ignored during replay", page);
                    continue;
                }

                wear = Some(wear.map_or(tag.erase_count, |w| w.max(tag.erase_count)));
                newest = Some(newest.map_or(tag.seq, |s| s.max(tag.seq)));
                if tag.kind == TagKind::Trim {
                    trim_lists.insert(page, decode_trim_list(&data, tag.logical));
                }
                entries.push(JournalEntry {
                    seq: tag.seq,
                    kind: tag.kind,
                    logical: tag.logical,
                    physical: page,
                });
            }

            let info = blocks.get_mut(block);
            info.written = written;
            info.state = if written == 0 {
                BlockState::Free
            } else {
                BlockState::Used
            };
            if let Some(count) = wear {
                info.erase_count = count;
                known_wear[block as usize] = true;
            }
            if written > 0 && written < pages_per_block {
                if let Some(seq) = newest {
                    if resume.map_or(true, |(s, _)| seq > s) {
                        resume = Some((seq, block));
                    }
                }
            }
        }

        // Blocks without a readable tag inherit the mean wear of the rest.
        let mean = blocks.mean_erase_count(&known_wear);
        for block in 0..geometry.num_blocks {
            let info = blocks.get_mut(block);
            if !known_wear[block as usize] && info.state != BlockState::Bad {
                info.erase_count = mean;
            }
        }

        let Replay {
            map,
            trims,
            next_seq,
        } = Journal::replay(entries, &trim_lists, capacity, geometry.total_pages());

        for logical in 0..capacity {
            if let Some(page) = map.lookup(logical) {
                blocks.add_live(geometry.block_of(page));
            }
        }
        let mut trim_refs: HashMap<u32, u32> = HashMap::new();
        for &record in trims.values() {
            *trim_refs.entry(record).or_insert(0) += 1;
        }
        for &record in trim_refs.keys() {
            blocks.add_live(geometry.block_of(record));
        }

        let cursor = resume.map(|(_, block)| {
            blocks.set_state(block, BlockState::Active);
            Cursor {
                block,
                next: blocks.get(block).written,
            }
        });

        info!(
            "Translation layer mounted: {} logical pages, {} mapped, {} free blocks, {} bad blocks",
            capacity,
            map.mapped_count(),
            blocks.free_count(),
            blocks.count(BlockState::Bad)
        );

        Ok(Ftl {
            device,
            geometry,
            capacity,
            map,
            trims,
            trim_refs,
            journal: Journal::new(next_seq, JOURNAL_WINDOW),
            blocks,
            cursor,
            relocating: false,
            stats: FtlStats::default(),
        })
    }

    /// Number of logical pages; fixed for the life of the chip.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn page_size(&self) -> usize {
        self.geometry.page_size()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn stats(&self) -> FtlStats {
        self.stats
    }

    pub fn block_info(&self, block: u32) -> Option<BlockInfo> {
        (block < self.blocks.len()).then(|| self.blocks.get(block))
    }

    pub fn bad_blocks(&self) -> Vec<u32> {
        self.blocks.bad_blocks()
    }

    pub fn free_blocks(&self) -> u32 {
        self.blocks.free_count()
    }

    pub fn mapped_pages(&self) -> usize {
        self.map.mapped_count()
    }

    /// Minimum and maximum erase counts across good blocks.
    pub fn wear_spread(&self) -> (u32, u32) {
        self.blocks.wear_spread()
    }

    pub fn recent_remaps(&self) -> Vec<JournalEntry> {
        self.journal.recent().copied().collect()
    }

    /// Give the device back, e.g. to remount it after a simulated reboot.
    pub fn into_device(self) -> D {
        self.device
    }

    /// Read a logical page. Never-written and trimmed pages read as erased
    /// (all 0xFF); an uncorrectable error is [`StorageError::Ecc`].
    pub fn read(&mut self, logical: u32, buf: &mut [u8]) -> Result<()> {
        self.check_logical(logical)?;
        self.check_len(buf.len())?;
        self.stats.user_reads += 1;

        let Some(page) = self.map.lookup(logical) else {
            buf.fill(0xFF);
            return Ok(());
        };
        match self.device.read(page, buf, &mut []) {
            Err(StorageError::Ecc(p)) => {
                self.stats.ecc_errors += 1;
                Err(StorageError::Ecc(p))
            }
            other => other,
        }
    }

    /// Write a logical page out of place.
    ///
    /// A program failure retires the block and returns
    /// [`StorageError::BadBlock`]; the mapping is unchanged and the caller
    /// may retry.
    pub fn write(&mut self, logical: u32, data: &[u8]) -> Result<()> {
        self.check_logical(logical)?;
        self.check_len(data.len())?;

        let page = self.program_record(TagKind::Data, logical, data)?;
        self.stats.user_writes += 1;

        if let Some(old) = self.map.remap(logical, page) {
            self.release_page(old);
        }
        self.blocks.add_live(self.geometry.block_of(page));
        if let Some(record) = self.trims.remove(&logical) {
            self.release_trim_ref(record);
        }
        Ok(())
    }

    /// Mark logical pages as unused so their physical pages can be reclaimed.
    pub fn trim(&mut self, range: Range<u32>) -> Result<()> {
        if range.start > range.end || range.end > self.capacity {
            return Err(StorageError::Parameter(format!(
                "trim range {:?} outside 0..{}",
                range, self.capacity
            )));
        }

        let mapped: Vec<u32> = range.filter(|&l| self.map.lookup(l).is_some()).collect();
        let page_size = self.page_size();

        for chunk in mapped.chunks(trim_entries_per_page(page_size)) {
            let payload = encode_trim_list(chunk, page_size);
            let record = self.program_record(TagKind::Trim, chunk.len() as u32, &payload)?;
            self.blocks.add_live(self.geometry.block_of(record));
            self.trim_refs.insert(record, chunk.len() as u32);

            for &logical in chunk {
                if let Some(old) = self.map.unmap(logical) {
                    self.release_page(old);
                }
                self.trims.insert(logical, record);
            }
            self.stats.trimmed_pages += chunk.len() as u64;
        }
        Ok(())
    }

    /// Flush point. Page programs are already durable when they return, so
    /// this only closes the in-memory remap window.
    pub fn sync(&mut self) -> Result<()> {
        let n = self.journal.checkpoint();
        debug!("Translation layer sync: {} remaps since last checkpoint", n);
        Ok(())
    }

    fn check_logical(&self, logical: u32) -> Result<()> {
        if logical >= self.capacity {
            return Err(StorageError::Parameter(format!(
                "logical page {} beyond capacity {}",
                logical, self.capacity
            )));
        }
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.page_size() {
            return Err(StorageError::Data(format!(
                "buffer of {} bytes, page size is {}",
                len,
                self.page_size()
            )));
        }
        Ok(())
    }

    fn is_live(&self, page: u32) -> bool {
        self.map.owner(page).is_some() || self.trim_refs.contains_key(&page)
    }

    fn release_page(&mut self, page: u32) {
        self.blocks.remove_live(self.geometry.block_of(page));
    }

    fn release_trim_ref(&mut self, record: u32) {
        let Some(refs) = self.trim_refs.get_mut(&record) else {
            return;
        };
        *refs -= 1;
        if *refs == 0 {
            self.trim_refs.remove(&record);
            self.release_page(record);
        }
    }

    fn alloc_page(&mut self) -> Result<u32> {
        loop {
            if let Some(cursor) = self.cursor {
                if cursor.next < self.geometry.pages_per_block() {
                    self.cursor = Some(Cursor {
                        block: cursor.block,
                        next: cursor.next + 1,
                    });
                    self.blocks.note_written(cursor.block);
                    return Ok(self.geometry.first_page(cursor.block) + cursor.next);
                }
                self.blocks.set_state(cursor.block, BlockState::Used);
                self.cursor = None;
            }
            self.open_block()?;
        }
    }

    fn open_block(&mut self) -> Result<()> {
        if !self.relocating {
            while self.blocks.free_count() <= GC_RESERVE_BLOCKS {
                if !self.collect_garbage()? {
                    break;
                }
            }
            // Relocation may have left a partially filled block open.
            if self.cursor.is_some() {
                return Ok(());
            }
        }

        let block = self
            .blocks
            .take_least_worn_free()
            .ok_or_else(|| StorageError::Hardware("no free blocks left".into()))?;
        self.cursor = Some(Cursor { block, next: 0 });
        Ok(())
    }

    /// Program one tagged record into the next free page.
    fn program_record(&mut self, kind: TagKind, logical: u32, data: &[u8]) -> Result<u32> {
        let page = self.alloc_page()?;
        let block = self.geometry.block_of(page);
        let seq = self.journal.next_seq();
        let tag = PageTag::new(kind, logical, seq, self.blocks.get(block).erase_count, data);

        match self.device.program(page, data, &tag.to_bytes()) {
            Ok(()) => {
                self.journal.record(JournalEntry {
                    seq,
                    kind,
                    logical,
                    physical: page,
                });
                Ok(page)
            }
            Err(StorageError::BadBlock(_)) => {
                self.retire_block(block)?;
                Err(StorageError::BadBlock(block))
            }
            Err(e) => Err(e),
        }
    }

    /// Internal writes (relocation) get one retry on a fresh block.
    fn program_with_retry(&mut self, kind: TagKind, logical: u32, data: &[u8]) -> Result<u32> {
        match self.program_record(kind, logical, data) {
            Err(e) if e.is_recoverable() => {
                warn!("Relocation write failed ({}), retrying", e);
                self.program_record(kind, logical, data).map_err(|e| {
                    StorageError::Hardware(format!("relocation failed twice: {}", e))
                })
            }
            other => other,
        }
    }

    fn read_for_relocation(&mut self, page: u32, data: &mut [u8], spare: &mut [u8]) -> Result<()> {
        match self.device.read(page, data, spare) {
            Err(StorageError::Ecc(_)) => {
                self.stats.ecc_errors += 1;
                self.device.read(page, data, spare).map_err(|e| {
                    StorageError::Hardware(format!("live page {} unreadable: {}", page, e))
                })
            }
            other => other,
        }
    }

    fn relocate(&mut self, page: u32) -> Result<()> {
        let mut data = vec![0u8; self.page_size()];
        let mut spare = [0u8; TAG_LEN];
        self.read_for_relocation(page, &mut data, &mut spare)?;
        let tag = PageTag::from_bytes(&spare)
            .ok_or_else(|| StorageError::Data(format!("live page {} has no tag", page)))?;

        match tag.kind {
            TagKind::Data => {
                let Some(logical) = self.map.owner(page) else {
                    return Ok(());
                };
                let new = self.program_with_retry(TagKind::Data, logical, &data)?;
                if let Some(old) = self.map.remap(logical, new) {
                    self.release_page(old);
                }
                self.blocks.add_live(self.geometry.block_of(new));
            }
            TagKind::Trim => {
                let still: Vec<u32> = decode_trim_list(&data, tag.logical)
                    .into_iter()
                    .filter(|l| self.trims.get(l) == Some(&page))
                    .collect();
                if self.trim_refs.remove(&page).is_some() {
                    self.release_page(page);
                }
                if still.is_empty() {
                    return Ok(());
                }
                let payload = encode_trim_list(&still, self.page_size());
                let new = self.program_with_retry(TagKind::Trim, still.len() as u32, &payload)?;
                self.blocks.add_live(self.geometry.block_of(new));
                self.trim_refs.insert(new, still.len() as u32);
                for logical in still {
                    self.trims.insert(logical, new);
                }
            }
        }
        self.stats.relocations += 1;
        Ok(())
    }

    fn evacuate(&mut self, block: u32) -> Result<()> {
        let first = self.geometry.first_page(block);
        for page in first..first + self.geometry.pages_per_block() {
            if self.is_live(page) {
                self.relocate(page)?;
            }
        }
        Ok(())
    }

    /// Reclaim one block. Returns false if no block has reclaimable pages.
    fn collect_garbage(&mut self) -> Result<bool> {
        let Some(victim) = self.blocks.pick_victim() else {
            return Ok(false);
        };
        let info = self.blocks.get(victim);
        debug!(
            "Garbage collecting block {} ({} of {} pages live)",
            victim, info.live, info.written
        );

        self.relocating = true;
        let result = self
            .evacuate(victim)
            .and_then(|()| self.erase_block(victim));
        self.relocating = false;
        result?;

        self.stats.gc_cycles += 1;
        Ok(true)
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        match self.device.erase(block) {
            Ok(()) => {
                self.blocks.mark_erased(block);
                self.stats.erases += 1;
                Ok(())
            }
            Err(StorageError::BadBlock(_)) => {
                warn!("Erase of block {} failed, marking bad", block);
                self.device.mark_bad(block);
                self.blocks.mark_bad(block);
                self.stats.retired_blocks += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Move live pages off a failing block and retire it permanently.
    fn retire_block(&mut self, block: u32) -> Result<()> {
        warn!("Program failure in block {}, retiring", block);
        if self.cursor.map(|c| c.block) == Some(block) {
            self.cursor = None;
        }
        self.blocks.set_state(block, BlockState::Retiring);

        let was_relocating = std::mem::replace(&mut self.relocating, true);
        let result = self.evacuate(block);
        self.relocating = was_relocating;

        self.device.mark_bad(block);
        self.blocks.mark_bad(block);
        self.stats.retired_blocks += 1;
        result
    }
}
