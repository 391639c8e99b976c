//! Sector-addressed block device contract
//!
//! The filesystem and the host mass-storage collaborator both reach storage
//! through [`Disk`]. Two board variants implement it: [`NandDisk`] (raw NAND
//! behind the translation layer) and [`ImageDisk`] (an SD-card style sector
//! image with no translation layer).

pub mod board;
pub mod image;
pub mod nand;

pub use board::BoardDisk;
pub use image::ImageDisk;
pub use nand::NandDisk;

use crate::error::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    Ready,
    NotInitialized,
    /// Initialization was attempted and failed
    NoDisk,
    /// Queried from inside an operation already holding the device
    Busy,
}

/// Control requests understood by every disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    /// Flush any cached writes
    Sync,
    GetSectorCount,
    GetSectorSize,
    /// Erase unit in sectors
    GetBlockSize,
    /// Sectors `start..=end` no longer hold data
    Trim { start: u64, end: u64 },
}

/// Block device handle
///
/// Handles are cheap clones of one shared device; every method takes `&self`
/// and serializes internally.
pub trait Disk: Clone + Send + 'static {
    fn initialize(&self) -> Result<DiskStatus>;

    fn status(&self) -> DiskStatus;

    /// Read `count` sectors starting at `start` into `buf`.
    fn read_sectors(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<()>;

    /// Write `count` sectors starting at `start` from `data`.
    fn write_sectors(&self, start: u64, count: usize, data: &[u8]) -> Result<()>;

    /// Returns the requested quantity, or 0 for commands without a result.
    fn ioctl(&self, cmd: Ioctl) -> Result<u64>;

    fn sector_size(&self) -> Result<usize> {
        self.ioctl(Ioctl::GetSectorSize).map(|v| v as usize)
    }

    fn sector_count(&self) -> Result<u64> {
        self.ioctl(Ioctl::GetSectorCount)
    }

    fn sync(&self) -> Result<()> {
        self.ioctl(Ioctl::Sync).map(|_| ())
    }

    /// Trim the half-open range `start..end`.
    fn trim(&self, start: u64, end: u64) -> Result<()> {
        if end <= start {
            return Ok(());
        }
        self.ioctl(Ioctl::Trim {
            start,
            end: end - 1,
        })
        .map(|_| ())
    }
}

/// Shared argument check for sector transfers.
pub(crate) fn check_transfer(
    start: u64,
    count: usize,
    len: usize,
    sector_size: usize,
    sector_count: u64,
) -> Result<()> {
    if count.checked_mul(sector_size) != Some(len) {
        return Err(StorageError::Data(format!(
            "buffer of {} bytes for {} sectors of {} bytes",
            len, count, sector_size
        )));
    }
    match start.checked_add(count as u64) {
        Some(end) if end <= sector_count => Ok(()),
        _ => Err(StorageError::Parameter(format!(
            "{} sectors at {} beyond device end {}",
            count, start, sector_count
        ))),
    }
}
