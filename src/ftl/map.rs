//! Page tags, the logical→physical map and its replay journal
//!
//! Every programmed page carries a [`PageTag`] in its spare area. Taken
//! together the tags are an append-only journal: replaying them in sequence
//! order rebuilds the [`TranslationMap`] after a restart.

use std::collections::{HashMap, VecDeque};

pub const TAG_MAGIC: u16 = 0x4654;
pub const TAG_LEN: usize = 24;

/// Sentinel for "no page" in the dense map tables.
const NONE: u32 = u32::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Page holds user data for `logical`
    Data = 1,
    /// Page holds a list of `logical` trimmed logical pages
    Trim = 2,
}

impl TagKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TagKind::Data),
            2 => Some(TagKind::Trim),
            _ => None,
        }
    }
}

/// Spare-area record written alongside every page
///
/// # Layout
///
/// ```text
/// 0..2   magic (LE)
/// 2      kind
/// 3      reserved
/// 4..8   logical page, or entry count for trim records
/// 8..16  sequence number
/// 16..20 erase count of the containing block
/// 20..24 CRC-32 over bytes 0..20 and the page data
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTag {
    pub kind: TagKind,
    pub logical: u32,
    pub seq: u64,
    pub erase_count: u32,
    pub crc: u32,
}

impl PageTag {
    pub fn new(kind: TagKind, logical: u32, seq: u64, erase_count: u32, data: &[u8]) -> Self {
        let mut tag = PageTag {
            kind,
            logical,
            seq,
            erase_count,
            crc: 0,
        };
        tag.crc = tag.compute_crc(data);
        tag
    }

    fn header_bytes(&self) -> [u8; 20] {
        let mut bytes = [0u8; 20];
        bytes[0..2].copy_from_slice(&TAG_MAGIC.to_le_bytes());
        bytes[2] = self.kind as u8;
        bytes[4..8].copy_from_slice(&self.logical.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.seq.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.erase_count.to_le_bytes());
        bytes
    }

    fn compute_crc(&self, data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.header_bytes());
        hasher.update(data);
        hasher.finalize()
    }

    pub fn to_bytes(&self) -> [u8; TAG_LEN] {
        let mut bytes = [0u8; TAG_LEN];
        bytes[0..20].copy_from_slice(&self.header_bytes());
        bytes[20..24].copy_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    /// Decode a tag; `None` for erased or foreign spare contents.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TAG_LEN {
            return None;
        }
        if u16::from_le_bytes([bytes[0], bytes[1]]) != TAG_MAGIC {
            return None;
        }
        let kind = TagKind::from_u8(bytes[2])?;
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[8..16]);
        Some(PageTag {
            kind,
            logical: word(4),
            seq: u64::from_le_bytes(seq),
            erase_count: word(16),
            crc: word(20),
        })
    }

    /// True if `data` is the page this tag was written with.
    pub fn verify(&self, data: &[u8]) -> bool {
        self.compute_crc(data) == self.crc
    }
}

/// Encode a trim record payload: LE `u32` logical pages, padded with 0xFF.
pub fn encode_trim_list(entries: &[u32], page_size: usize) -> Vec<u8> {
    let mut data = vec![0xFF; page_size];
    for (i, logical) in entries.iter().enumerate() {
        data[i * 4..i * 4 + 4].copy_from_slice(&logical.to_le_bytes());
    }
    data
}

pub fn decode_trim_list(data: &[u8], count: u32) -> Vec<u32> {
    data.chunks_exact(4)
        .take(count as usize)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Number of logical pages one trim record can carry.
pub fn trim_entries_per_page(page_size: usize) -> usize {
    page_size / 4
}

/// Dense logical→physical map with a reverse index
#[derive(Debug, Clone)]
pub struct TranslationMap {
    forward: Vec<u32>,
    reverse: Vec<u32>,
    mapped: usize,
}

impl TranslationMap {
    pub fn new(capacity: u32, total_pages: u32) -> Self {
        TranslationMap {
            forward: vec![NONE; capacity as usize],
            reverse: vec![NONE; total_pages as usize],
            mapped: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.forward.len() as u32
    }

    pub fn lookup(&self, logical: u32) -> Option<u32> {
        match self.forward.get(logical as usize) {
            Some(&p) if p != NONE => Some(p),
            _ => None,
        }
    }

    /// Logical page currently stored at `physical`, if that page is live.
    pub fn owner(&self, physical: u32) -> Option<u32> {
        match self.reverse.get(physical as usize) {
            Some(&l) if l != NONE => Some(l),
            _ => None,
        }
    }

    /// Point `logical` at `physical`; returns the superseded page.
    pub fn remap(&mut self, logical: u32, physical: u32) -> Option<u32> {
        let old = self.unmap(logical);
        self.forward[logical as usize] = physical;
        self.reverse[physical as usize] = logical;
        self.mapped += 1;
        old
    }

    pub fn unmap(&mut self, logical: u32) -> Option<u32> {
        let old = self.lookup(logical)?;
        self.forward[logical as usize] = NONE;
        self.reverse[old as usize] = NONE;
        self.mapped -= 1;
        Some(old)
    }

    pub fn mapped_count(&self) -> usize {
        self.mapped
    }
}

/// One replayable remap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: u64,
    pub kind: TagKind,
    pub logical: u32,
    pub physical: u32,
}

/// Outcome of replaying the on-flash journal
pub struct Replay {
    pub map: TranslationMap,
    /// logical -> physical page of the trim record that shadows it
    pub trims: HashMap<u32, u32>,
    pub next_seq: u64,
}

/// Sequence allocator plus a bounded window of recent remaps
///
/// The window is informational (stats, debugging after a fault); the durable
/// journal is the set of page tags on flash.
#[derive(Debug)]
pub struct Journal {
    next_seq: u64,
    recent: VecDeque<JournalEntry>,
    window: usize,
}

impl Journal {
    pub fn new(next_seq: u64, window: usize) -> Self {
        Journal {
            next_seq,
            recent: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn peek_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn record(&mut self, entry: JournalEntry) {
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(entry);
    }

    /// Drop the window once everything in it is known durable.
    pub fn checkpoint(&mut self) -> usize {
        let n = self.recent.len();
        self.recent.clear();
        n
    }

    pub fn recent(&self) -> impl Iterator<Item = &JournalEntry> {
        self.recent.iter()
    }

    /// Rebuild the map from tags gathered during the mount scan.
    ///
    /// `trim_lists` maps a trim record's physical page to the logical pages
    /// it lists.
    pub fn replay(
        mut entries: Vec<JournalEntry>,
        trim_lists: &HashMap<u32, Vec<u32>>,
        capacity: u32,
        total_pages: u32,
    ) -> Replay {
        entries.sort_by_key(|e| e.seq);

        let mut map = TranslationMap::new(capacity, total_pages);
        let mut trims = HashMap::new();
        let mut next_seq = 0;

        for entry in &entries {
            next_seq = entry.seq + 1;
            match entry.kind {
                TagKind::Data => {
                    if entry.logical >= capacity {
                        tracing::warn!(
                            "Ignoring journal entry for logical page {} beyond capacity {}",
                            entry.logical,
                            capacity
                        );
                        continue;
                    }
                    map.remap(entry.logical, entry.physical);
                    trims.remove(&entry.logical);
                }
                TagKind::Trim => {
                    let Some(list) = trim_lists.get(&entry.physical) else {
                        continue;
                    };
                    for &logical in list.iter().filter(|&&l| l < capacity) {
                        map.unmap(logical);
                        trims.insert(logical, entry.physical);
                    }
                }
            }
        }

        Replay {
            map,
            trims,
            next_seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_encoding() {
        let data = vec![7u8; 512];
        let tag = PageTag::new(TagKind::Data, 42, 9, 3, &data);
        let decoded = PageTag::from_bytes(&tag.to_bytes()).unwrap();
        assert_eq!(decoded, tag);
        assert!(decoded.verify(&data));

        let mut torn = data.clone();
        torn[500] = 0xFF;
        assert!(!decoded.verify(&torn));
    }

    #[test]
    fn test_erased_spare_has_no_tag() {
        assert!(PageTag::from_bytes(&[0xFF; TAG_LEN]).is_none());
        assert!(PageTag::from_bytes(&[0xFF; 4]).is_none());
    }

    #[test]
    fn test_map_remap_and_owner() {
        let mut map = TranslationMap::new(8, 32);
        assert_eq!(map.remap(1, 10), None);
        assert_eq!(map.remap(1, 11), Some(10));
        assert_eq!(map.owner(10), None);
        assert_eq!(map.owner(11), Some(1));
        assert_eq!(map.mapped_count(), 1);
        assert_eq!(map.unmap(1), Some(11));
        assert_eq!(map.lookup(1), None);
        assert_eq!(map.mapped_count(), 0);
    }

    #[test]
    fn test_replay_orders_by_sequence() {
        let entries = vec![
            JournalEntry { seq: 5, kind: TagKind::Data, logical: 0, physical: 7 },
            JournalEntry { seq: 2, kind: TagKind::Data, logical: 0, physical: 3 },
            JournalEntry { seq: 3, kind: TagKind::Data, logical: 1, physical: 4 },
            JournalEntry { seq: 4, kind: TagKind::Trim, logical: 1, physical: 6 },
        ];
        let mut lists = HashMap::new();
        lists.insert(6, vec![1]);

        let replay = Journal::replay(entries, &lists, 4, 16);
        assert_eq!(replay.map.lookup(0), Some(7));
        assert_eq!(replay.map.lookup(1), None);
        assert_eq!(replay.trims.get(&1), Some(&6));
        assert_eq!(replay.next_seq, 6);
    }

    #[test]
    fn test_trim_list_encoding() {
        let data = encode_trim_list(&[3, 9, 12], 512);
        assert_eq!(decode_trim_list(&data, 3), vec![3, 9, 12]);
        assert_eq!(trim_entries_per_page(512), 128);
    }

    #[test]
    fn test_journal_window() {
        let mut journal = Journal::new(0, 2);
        for i in 0..3 {
            let seq = journal.next_seq();
            journal.record(JournalEntry { seq, kind: TagKind::Data, logical: i, physical: i });
        }
        assert_eq!(journal.recent().count(), 2);
        assert_eq!(journal.checkpoint(), 2);
        assert_eq!(journal.peek_seq(), 3);
    }
}
