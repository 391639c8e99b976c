//! Raw NAND device contract
//!
//! The translation layer talks to flash only through [`NandDevice`]. Pages are
//! programmed whole (data area plus spare area) and only after their block has
//! been erased; the spare area carries the per-page tag used for journal replay
//! and, on the first page of a block, the persistent bad-block marker.

pub mod sim;

pub use sim::SimNand;

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// Byte written to the marker position of a block's first page to retire it.
pub const BAD_BLOCK_MARK: u8 = b'X';

/// Offset of the bad-block marker inside the spare area.
pub const BAD_MARK_OFFSET: usize = 0x40;

/// Upper bound for a single program/erase/read before it is reported as a
/// hardware fault.
pub const OP_TIMEOUT_MS: u64 = 50;

/// Physical layout of a NAND chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// log2 of the data area size of one page
    pub log2_page_size: u8,

    /// log2 of the number of pages per erase block
    pub log2_pages_per_block: u8,

    /// Number of erase blocks on the chip
    pub num_blocks: u32,

    /// Spare (out-of-band) bytes per page
    pub spare_size: usize,
}

impl Geometry {
    /// 4 Gbit part fitted to the flight computers: 4 KiB pages, 64 pages per
    /// block, 2048 blocks.
    pub const MT29F4G: Geometry = Geometry {
        log2_page_size: 12,
        log2_pages_per_block: 6,
        num_blocks: 2048,
        spare_size: 256,
    };

    /// Small chip used by tests and benches.
    pub const fn small(num_blocks: u32) -> Geometry {
        Geometry {
            log2_page_size: 9,
            log2_pages_per_block: 4,
            num_blocks,
            spare_size: 128,
        }
    }

    pub fn page_size(&self) -> usize {
        1usize << self.log2_page_size
    }

    pub fn pages_per_block(&self) -> u32 {
        1u32 << self.log2_pages_per_block
    }

    pub fn block_bytes(&self) -> usize {
        self.page_size() << self.log2_pages_per_block
    }

    pub fn total_pages(&self) -> u32 {
        self.num_blocks << self.log2_pages_per_block
    }

    pub fn block_of(&self, page: u32) -> u32 {
        page >> self.log2_pages_per_block
    }

    pub fn first_page(&self, block: u32) -> u32 {
        block << self.log2_pages_per_block
    }

    pub fn validate(&self) -> Result<()> {
        if !(9..=16).contains(&self.log2_page_size) {
            return Err(StorageError::Parameter(format!(
                "page size 2^{} out of range",
                self.log2_page_size
            )));
        }
        if self.log2_pages_per_block == 0 || self.log2_pages_per_block > 10 {
            return Err(StorageError::Parameter(format!(
                "pages per block 2^{} out of range",
                self.log2_pages_per_block
            )));
        }
        if self.num_blocks < 8 {
            return Err(StorageError::Parameter(format!(
                "at least 8 blocks required, got {}",
                self.num_blocks
            )));
        }
        if self.spare_size <= BAD_MARK_OFFSET {
            return Err(StorageError::Parameter(format!(
                "spare area of {} bytes cannot hold the bad-block marker",
                self.spare_size
            )));
        }
        Ok(())
    }
}

/// Operations a raw NAND chip offers to the translation layer
///
/// Implementations block until the operation completes or
/// [`OP_TIMEOUT_MS`] elapses, in which case they return
/// [`StorageError::Timeout`].
pub trait NandDevice: Send {
    fn geometry(&self) -> Geometry;

    /// Probe the persistent bad-block marker. A marker page that fails ECC
    /// also counts as bad.
    fn is_bad(&mut self, block: u32) -> bool;

    /// Write the persistent bad-block marker.
    fn mark_bad(&mut self, block: u32);

    /// Erase a block. A device-reported failure is [`StorageError::BadBlock`].
    fn erase(&mut self, block: u32) -> Result<()>;

    /// Program one page. `data` must be exactly one page, `spare` at most the
    /// spare size. A device-reported failure is [`StorageError::BadBlock`].
    fn program(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<()>;

    /// Read one page. `data` may be empty to read only the spare area.
    /// An uncorrectable error is [`StorageError::Ecc`].
    fn read(&mut self, page: u32, data: &mut [u8], spare: &mut [u8]) -> Result<()>;

    /// True if the page reads back fully erased without an ECC error.
    fn is_free(&mut self, page: u32) -> bool;

    /// Copy a page through a host buffer.
    fn copy(&mut self, src: u32, dst: u32) -> Result<()> {
        let geometry = self.geometry();
        let mut data = vec![0u8; geometry.page_size()];
        let mut spare = vec![0u8; geometry.spare_size];
        self.read(src, &mut data, &mut spare)?;
        self.program(dst, &data, &spare)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mt29f4g_geometry() {
        let g = Geometry::MT29F4G;
        assert_eq!(g.page_size(), 4096);
        assert_eq!(g.pages_per_block(), 64);
        assert_eq!(g.block_bytes(), 256 * 1024);
        assert_eq!(g.total_pages(), 2048 * 64);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_page_block_arithmetic() {
        let g = Geometry::small(16);
        assert_eq!(g.block_of(0), 0);
        assert_eq!(g.block_of(17), 1);
        assert_eq!(g.first_page(3), 48);
    }

    #[test]
    fn test_invalid_geometry() {
        let mut g = Geometry::small(4);
        assert!(g.validate().is_err());
        g.num_blocks = 16;
        g.spare_size = 16;
        assert!(g.validate().is_err());
    }
}
