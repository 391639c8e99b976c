//! In-memory NAND chip with fault injection
//!
//! Clones share the same chip, so a test can drop a translation layer and
//! mount a fresh one on the same cells to model a reboot. Faults (failing
//! erase/program, ECC errors, power cuts, stalls) are injected through the
//! methods on [`SimNand`].

use super::{Geometry, NandDevice, BAD_BLOCK_MARK, BAD_MARK_OFFSET, OP_TIMEOUT_MS};
use crate::error::{Result, StorageError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Operation counters of the simulated chip
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub reads: u64,
    pub programs: u64,
    pub erases: u64,
}

struct Chip {
    geometry: Geometry,
    data: Vec<u8>,
    spare: Vec<u8>,
    erase_counts: Vec<u32>,
    programs_per_block: Vec<u64>,
    failing_erase: HashSet<u32>,
    failing_program: HashSet<u32>,
    /// page -> remaining failing reads
    ecc_faults: HashMap<u32, u32>,
    programs_until_cut: Option<u64>,
    powered: bool,
    stalls: u32,
    stats: SimStats,
}

impl Chip {
    fn data_range(&self, page: u32) -> std::ops::Range<usize> {
        let size = self.geometry.page_size();
        let start = page as usize * size;
        start..start + size
    }

    fn spare_range(&self, page: u32) -> std::ops::Range<usize> {
        let size = self.geometry.spare_size;
        let start = page as usize * size;
        start..start + size
    }

    fn check_page(&self, page: u32) -> Result<()> {
        if page >= self.geometry.total_pages() {
            return Err(StorageError::Parameter(format!("page {} out of range", page)));
        }
        Ok(())
    }

    fn check_ready(&mut self) -> Result<()> {
        if !self.powered {
            return Err(StorageError::Hardware("device unpowered".into()));
        }
        if self.stalls > 0 {
            self.stalls -= 1;
            return Err(StorageError::Timeout(OP_TIMEOUT_MS));
        }
        Ok(())
    }

    fn is_blank(&self, page: u32) -> bool {
        self.data[self.data_range(page)].iter().all(|&b| b == 0xFF)
            && self.spare[self.spare_range(page)].iter().all(|&b| b == 0xFF)
    }
}

/// Simulated NAND chip
#[derive(Clone)]
pub struct SimNand {
    chip: Arc<Mutex<Chip>>,
}

impl SimNand {
    /// Create a fully erased chip
    pub fn new(geometry: Geometry) -> Self {
        let pages = geometry.total_pages() as usize;
        let blocks = geometry.num_blocks as usize;
        SimNand {
            chip: Arc::new(Mutex::new(Chip {
                geometry,
                data: vec![0xFF; pages * geometry.page_size()],
                spare: vec![0xFF; pages * geometry.spare_size],
                erase_counts: vec![0; blocks],
                programs_per_block: vec![0; blocks],
                failing_erase: HashSet::new(),
                failing_program: HashSet::new(),
                ecc_faults: HashMap::new(),
                programs_until_cut: None,
                powered: true,
                stalls: 0,
                stats: SimStats::default(),
            })),
        }
    }

    /// Every later erase of `block` reports failure.
    pub fn fail_erase(&self, block: u32) {
        self.chip.lock().failing_erase.insert(block);
    }

    /// Every later program into `block` reports failure.
    pub fn fail_program(&self, block: u32) {
        self.chip.lock().failing_program.insert(block);
    }

    /// The next `reads` reads of `page` return an uncorrectable ECC error.
    pub fn inject_ecc(&self, page: u32, reads: u32) {
        self.chip.lock().ecc_faults.insert(page, reads);
    }

    /// Allow `programs` more programs, then tear the next one in half and
    /// drop power.
    pub fn cut_power_after(&self, programs: u64) {
        self.chip.lock().programs_until_cut = Some(programs);
    }

    pub fn restore_power(&self) {
        let mut chip = self.chip.lock();
        chip.powered = true;
        chip.programs_until_cut = None;
    }

    /// The next `ops` operations exceed the operation timeout.
    pub fn stall(&self, ops: u32) {
        self.chip.lock().stalls = ops;
    }

    pub fn clear_faults(&self) {
        let mut chip = self.chip.lock();
        chip.failing_erase.clear();
        chip.failing_program.clear();
        chip.ecc_faults.clear();
        chip.stalls = 0;
    }

    pub fn erase_count(&self, block: u32) -> u32 {
        self.chip.lock().erase_counts[block as usize]
    }

    pub fn programs_in_block(&self, block: u32) -> u64 {
        self.chip.lock().programs_per_block[block as usize]
    }

    pub fn stats(&self) -> SimStats {
        self.chip.lock().stats
    }

    /// Raw contents of a page's data area
    pub fn page_data(&self, page: u32) -> Vec<u8> {
        let chip = self.chip.lock();
        chip.data[chip.data_range(page)].to_vec()
    }
}

impl NandDevice for SimNand {
    fn geometry(&self) -> Geometry {
        self.chip.lock().geometry
    }

    fn is_bad(&mut self, block: u32) -> bool {
        let chip = self.chip.lock();
        if block >= chip.geometry.num_blocks {
            return true;
        }
        let page = chip.geometry.first_page(block);
        if chip.ecc_faults.get(&page).copied().unwrap_or(0) > 0 {
            return true;
        }
        chip.spare[chip.spare_range(page).start + BAD_MARK_OFFSET] == BAD_BLOCK_MARK
    }

    fn mark_bad(&mut self, block: u32) {
        let mut chip = self.chip.lock();
        if block >= chip.geometry.num_blocks || !chip.powered {
            return;
        }
        let page = chip.geometry.first_page(block);
        let offset = chip.spare_range(page).start + BAD_MARK_OFFSET;
        chip.spare[offset] = BAD_BLOCK_MARK;
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        let mut chip = self.chip.lock();
        if block >= chip.geometry.num_blocks {
            return Err(StorageError::Parameter(format!("block {} out of range", block)));
        }
        chip.check_ready()?;
        if chip.failing_erase.contains(&block) {
            return Err(StorageError::BadBlock(block));
        }

        let first = chip.geometry.first_page(block);
        let pages = chip.geometry.pages_per_block();
        let data_start = chip.data_range(first).start;
        let data_end = chip.data_range(first + pages - 1).end;
        let spare_start = chip.spare_range(first).start;
        let spare_end = chip.spare_range(first + pages - 1).end;
        chip.data[data_start..data_end].fill(0xFF);
        chip.spare[spare_start..spare_end].fill(0xFF);
        chip.erase_counts[block as usize] += 1;
        chip.stats.erases += 1;
        Ok(())
    }

    fn program(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<()> {
        let mut chip = self.chip.lock();
        chip.check_page(page)?;
        if data.len() != chip.geometry.page_size() || spare.len() > chip.geometry.spare_size {
            return Err(StorageError::Data(format!(
                "program of {}+{} bytes does not fit page {}",
                data.len(),
                spare.len(),
                page
            )));
        }
        chip.check_ready()?;

        let block = chip.geometry.block_of(page);
        if chip.failing_program.contains(&block) {
            return Err(StorageError::BadBlock(block));
        }
        if !chip.is_blank(page) {
            return Err(StorageError::Hardware(format!(
                "program of unerased page {}",
                page
            )));
        }

        let data_range = chip.data_range(page);
        let spare_start = chip.spare_range(page).start;

        if let Some(remaining) = chip.programs_until_cut {
            if remaining == 0 {
                // Torn program: half the data lands, the rest stays erased.
                let half = data.len() / 2;
                chip.data[data_range.start..data_range.start + half].copy_from_slice(&data[..half]);
                chip.spare[spare_start..spare_start + spare.len()].copy_from_slice(spare);
                chip.powered = false;
                chip.programs_until_cut = None;
                return Err(StorageError::Hardware("power lost during program".into()));
            }
            chip.programs_until_cut = Some(remaining - 1);
        }

        chip.data[data_range].copy_from_slice(data);
        chip.spare[spare_start..spare_start + spare.len()].copy_from_slice(spare);
        chip.programs_per_block[block as usize] += 1;
        chip.stats.programs += 1;
        Ok(())
    }

    fn read(&mut self, page: u32, data: &mut [u8], spare: &mut [u8]) -> Result<()> {
        let mut chip = self.chip.lock();
        chip.check_page(page)?;
        if !(data.is_empty() || data.len() == chip.geometry.page_size())
            || spare.len() > chip.geometry.spare_size
        {
            return Err(StorageError::Data(format!(
                "read of {}+{} bytes does not match page {}",
                data.len(),
                spare.len(),
                page
            )));
        }
        chip.check_ready()?;
        chip.stats.reads += 1;

        if let Some(remaining) = chip.ecc_faults.get_mut(&page) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Ecc(page));
            }
        }

        if !data.is_empty() {
            let range = chip.data_range(page);
            data.copy_from_slice(&chip.data[range]);
        }
        let start = chip.spare_range(page).start;
        spare.copy_from_slice(&chip.spare[start..start + spare.len()]);
        Ok(())
    }

    fn is_free(&mut self, page: u32) -> bool {
        let chip = self.chip.lock();
        if page >= chip.geometry.total_pages() {
            return false;
        }
        if chip.ecc_faults.get(&page).copied().unwrap_or(0) > 0 {
            return false;
        }
        chip.is_blank(page)
    }
}
