//! Per-block bookkeeping: state, wear and live-page counts

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Erased and available
    Free,
    /// Current write target
    Active,
    /// Fully or partially written, not the write target
    Used,
    /// Being evacuated after a failure
    Retiring,
    /// Permanently excluded
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub state: BlockState,
    pub erase_count: u32,
    /// Pages holding live records (mapped data or shadowing trim records)
    pub live: u32,
    /// Pages consumed since the last erase
    pub written: u32,
}

impl BlockInfo {
    fn free(erase_count: u32) -> Self {
        BlockInfo {
            state: BlockState::Free,
            erase_count,
            live: 0,
            written: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockTable {
    blocks: Vec<BlockInfo>,
}

impl BlockTable {
    pub fn new(num_blocks: u32) -> Self {
        BlockTable {
            blocks: vec![BlockInfo::free(0); num_blocks as usize],
        }
    }

    pub fn len(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, block: u32) -> BlockInfo {
        self.blocks[block as usize]
    }

    pub fn get_mut(&mut self, block: u32) -> &mut BlockInfo {
        &mut self.blocks[block as usize]
    }

    pub fn set_state(&mut self, block: u32, state: BlockState) {
        self.blocks[block as usize].state = state;
    }

    pub fn count(&self, state: BlockState) -> u32 {
        self.blocks.iter().filter(|b| b.state == state).count() as u32
    }

    pub fn free_count(&self) -> u32 {
        self.count(BlockState::Free)
    }

    pub fn bad_blocks(&self) -> Vec<u32> {
        self.indices(|b| b.state == BlockState::Bad)
    }

    fn indices(&self, pred: impl Fn(&BlockInfo) -> bool) -> Vec<u32> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| pred(b))
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Take the least-worn free block as the new write target.
    pub fn take_least_worn_free(&mut self) -> Option<u32> {
        let block = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state == BlockState::Free)
            .min_by_key(|(i, b)| (b.erase_count, *i))
            .map(|(i, _)| i as u32)?;
        self.blocks[block as usize].state = BlockState::Active;
        Some(block)
    }

    /// Greedy victim: the used block with the fewest live pages that has at
    /// least one reclaimable page. Ties go to the least-worn block.
    pub fn pick_victim(&self) -> Option<u32> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state == BlockState::Used && b.live < b.written)
            .min_by_key(|(i, b)| (b.live, b.erase_count, *i))
            .map(|(i, _)| i as u32)
    }

    pub fn add_live(&mut self, block: u32) {
        self.blocks[block as usize].live += 1;
    }

    pub fn remove_live(&mut self, block: u32) {
        let info = &mut self.blocks[block as usize];
        info.live = info.live.saturating_sub(1);
    }

    pub fn note_written(&mut self, block: u32) {
        self.blocks[block as usize].written += 1;
    }

    pub fn mark_erased(&mut self, block: u32) {
        let erase_count = self.blocks[block as usize].erase_count + 1;
        self.blocks[block as usize] = BlockInfo::free(erase_count);
    }

    pub fn mark_bad(&mut self, block: u32) {
        let info = &mut self.blocks[block as usize];
        info.state = BlockState::Bad;
        info.live = 0;
    }

    /// Erase counts of good blocks as (min, max).
    pub fn wear_spread(&self) -> (u32, u32) {
        let mut good = self
            .blocks
            .iter()
            .filter(|b| b.state != BlockState::Bad)
            .map(|b| b.erase_count);
        let first = good.next().unwrap_or(0);
        good.fold((first, first), |(lo, hi), c| (lo.min(c), hi.max(c)))
    }

    /// Mean erase count over blocks whose count is known.
    pub fn mean_erase_count(&self, known: &[bool]) -> u32 {
        let (sum, n) = self
            .blocks
            .iter()
            .zip(known)
            .filter(|&(_, &k)| k)
            .fold((0u64, 0u64), |(s, n), (b, _)| (s + b.erase_count as u64, n + 1));
        if n == 0 {
            0
        } else {
            (sum / n) as u32
        }
    }
}
