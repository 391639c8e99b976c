//! Bitmap allocator for data-region sectors
//!
//! Each bit tracks one sector of the data region: 0 = free, 1 = allocated.
//! The bitmap is never persisted; mount rebuilds it from the sectors the
//! committed catalog owns.

use crate::error::{Result, StorageError};

#[derive(Debug, Clone)]
pub struct BitmapAllocator {
    /// Bitmap words (each word = 64 sectors)
    bitmap: Vec<u64>,

    /// Total number of sectors tracked
    total: u64,

    /// Number of free sectors available
    free: u64,
}

impl BitmapAllocator {
    pub fn new(total: u64) -> Self {
        let num_words = total.div_ceil(64) as usize;
        BitmapAllocator {
            bitmap: vec![0u64; num_words],
            total,
            free: total,
        }
    }

    /// Rebuild the bitmap from the sectors owned by committed files.
    ///
    /// A sector outside the data region or claimed twice means the catalog is
    /// corrupt.
    pub fn from_used(total: u64, used: impl IntoIterator<Item = u64>) -> Result<Self> {
        let mut alloc = Self::new(total);
        for sector in used {
            if sector >= total || alloc.is_allocated(sector) {
                return Err(StorageError::Data(format!(
                    "sector {} claimed twice or outside data region",
                    sector
                )));
            }
            alloc.set(sector);
        }
        Ok(alloc)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn free_count(&self) -> u64 {
        self.free
    }

    pub fn is_allocated(&self, sector: u64) -> bool {
        if sector >= self.total {
            return false;
        }
        let (word, bit) = Self::position(sector);
        (self.bitmap[word] & (1u64 << bit)) != 0
    }

    /// Allocate a run of up to `want` consecutive sectors; returns
    /// `(start, len)`.
    ///
    /// Continues at `hint` when it is free, otherwise takes the first
    /// `want`-aligned run that is entirely free. On a fragmented volume the
    /// run may be shorter than `want`, down to a single sector.
    pub fn allocate_run(&mut self, want: u64, hint: Option<u64>) -> Result<(u64, u64)> {
        if self.free == 0 {
            return Err(StorageError::OutOfSpace);
        }
        let want = want.max(1);

        let start = match hint {
            Some(h) if h < self.total && !self.is_allocated(h) => h,
            _ => self
                .find_aligned_run(want)
                .or_else(|| self.first_free())
                .ok_or(StorageError::OutOfSpace)?,
        };

        let mut len = 0;
        while len < want && start + len < self.total && !self.is_allocated(start + len) {
            self.set(start + len);
            len += 1;
        }
        Ok((start, len))
    }

    fn find_aligned_run(&self, want: u64) -> Option<u64> {
        let mut start = 0;
        while start + want <= self.total {
            match (start..start + want).rev().find(|&s| self.is_allocated(s)) {
                None => return Some(start),
                Some(used) => start = (used / want + 1) * want,
            }
        }
        None
    }

    fn set(&mut self, sector: u64) {
        let (word, bit) = Self::position(sector);
        self.bitmap[word] |= 1u64 << bit;
        self.free -= 1;
    }

    fn first_free(&self) -> Option<u64> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|&(_, &w)| w != u64::MAX)
            .map(|(i, &w)| i as u64 * 64 + (!w).trailing_zeros() as u64)
            .filter(|&s| s < self.total)
    }

    /// Free previously allocated sectors
    pub fn release(&mut self, sectors: &[u64]) -> Result<()> {
        for &sector in sectors {
            if sector >= self.total {
                return Err(StorageError::Parameter(format!(
                    "sector {} outside data region",
                    sector
                )));
            }

            if !self.is_allocated(sector) {
                // Already free - this is a double-free bug
                tracing::warn!("Double-free detected for sector {}", sector);
                continue;
            }

            let (word, bit) = Self::position(sector);
            self.bitmap[word] &= !(1u64 << bit);
            self.free += 1;
        }
        Ok(())
    }

    fn position(sector: u64) -> (usize, u32) {
        ((sector / 64) as usize, (sector % 64) as u32)
    }
}
