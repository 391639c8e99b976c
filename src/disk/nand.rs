//! Block device over the NAND translation layer
//!
//! Sectors map one-to-one onto logical pages. The writer task and the host
//! mass-storage collaborator share one [`NandDisk`] through clones; every
//! entry point takes the same `parking_lot::ReentrantMutex`, which can be
//! acquired without a scheduler and by a thread that already holds it.
//!
//! The lock is re-entrant but the translation layer behind it is not: a
//! nested call made while an operation is in progress gets
//! [`StorageError::Busy`] instead of aliasing the map.

use super::{check_transfer, Disk, DiskStatus, Ioctl};
use crate::error::{Result, StorageError};
use crate::ftl::{Ftl, FtlStats};
use crate::nand::NandDevice;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{error, info, warn};

enum Slot<D: NandDevice> {
    Uninit(D),
    Ready(Ftl<D>),
    Failed,
}

pub struct NandDisk<D: NandDevice> {
    inner: Arc<ReentrantMutex<RefCell<Slot<D>>>>,
}

impl<D: NandDevice> Clone for NandDisk<D> {
    fn clone(&self) -> Self {
        NandDisk {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: NandDevice> NandDisk<D> {
    /// Wrap a device; the translation layer mounts on [`Disk::initialize`].
    pub fn new(device: D) -> Self {
        Self::from_slot(Slot::Uninit(device))
    }

    /// Wrap an already mounted translation layer.
    pub fn from_ftl(ftl: Ftl<D>) -> Self {
        Self::from_slot(Slot::Ready(ftl))
    }

    fn from_slot(slot: Slot<D>) -> Self {
        NandDisk {
            inner: Arc::new(ReentrantMutex::new(RefCell::new(slot))),
        }
    }

    fn with_ftl<R>(&self, f: impl FnOnce(&mut Ftl<D>) -> Result<R>) -> Result<R> {
        let guard = self.inner.lock();
        let mut slot = guard.try_borrow_mut().map_err(|_| StorageError::Busy)?;
        match &mut *slot {
            Slot::Ready(ftl) => f(ftl),
            Slot::Uninit(_) => Err(StorageError::State("disk not initialized".into())),
            Slot::Failed => Err(StorageError::Hardware("disk failed to initialize".into())),
        }
    }

    pub fn ftl_stats(&self) -> Result<FtlStats> {
        self.with_ftl(|ftl| Ok(ftl.stats()))
    }

    pub fn bad_blocks(&self) -> Result<Vec<u32>> {
        self.with_ftl(|ftl| Ok(ftl.bad_blocks()))
    }
}

/// Run a translation layer operation, retrying once after a relocation. A
/// second bad-block or ECC failure escalates to a hardware error.
fn retry_once<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Err(e) if e.is_recoverable() => {
            warn!("Retrying after recoverable flash error: {}", e);
            op().map_err(|e| match e {
                e if e.is_recoverable() => {
                    StorageError::Hardware(format!("failed after relocation: {}", e))
                }
                e => e,
            })
        }
        other => other,
    }
}

impl<D: NandDevice + 'static> Disk for NandDisk<D> {
    fn initialize(&self) -> Result<DiskStatus> {
        let guard = self.inner.lock();
        let mut slot = guard.try_borrow_mut().map_err(|_| StorageError::Busy)?;
        match std::mem::replace(&mut *slot, Slot::Failed) {
            Slot::Uninit(device) => match Ftl::mount(device) {
                Ok(ftl) => {
                    info!("NAND disk ready: {} sectors", ftl.capacity());
                    *slot = Slot::Ready(ftl);
                    Ok(DiskStatus::Ready)
                }
                Err(e) => {
                    error!("Translation layer mount failed: {}", e);
                    Err(e)
                }
            },
            Slot::Ready(ftl) => {
                *slot = Slot::Ready(ftl);
                Ok(DiskStatus::Ready)
            }
            Slot::Failed => Ok(DiskStatus::NoDisk),
        }
    }

    fn status(&self) -> DiskStatus {
        let guard = self.inner.lock();
        let Ok(slot) = guard.try_borrow() else {
            return DiskStatus::Busy;
        };
        match &*slot {
            Slot::Ready(_) => DiskStatus::Ready,
            Slot::Uninit(_) => DiskStatus::NotInitialized,
            Slot::Failed => DiskStatus::NoDisk,
        }
    }

    fn read_sectors(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        self.with_ftl(|ftl| {
            let sector_size = ftl.page_size();
            check_transfer(start, count, buf.len(), sector_size, ftl.capacity() as u64)?;
            for (i, chunk) in buf.chunks_exact_mut(sector_size).enumerate() {
                let logical = (start + i as u64) as u32;
                retry_once(|| ftl.read(logical, &mut *chunk))?;
            }
            Ok(())
        })
    }

    fn write_sectors(&self, start: u64, count: usize, data: &[u8]) -> Result<()> {
        self.with_ftl(|ftl| {
            let sector_size = ftl.page_size();
            check_transfer(start, count, data.len(), sector_size, ftl.capacity() as u64)?;
            for (i, chunk) in data.chunks_exact(sector_size).enumerate() {
                let logical = (start + i as u64) as u32;
                retry_once(|| ftl.write(logical, chunk))?;
            }
            Ok(())
        })
    }

    fn ioctl(&self, cmd: Ioctl) -> Result<u64> {
        self.with_ftl(|ftl| match cmd {
            Ioctl::Sync => ftl.sync().map(|_| 0),
            Ioctl::GetSectorCount => Ok(ftl.capacity() as u64),
            Ioctl::GetSectorSize => Ok(ftl.page_size() as u64),
            Ioctl::GetBlockSize => Ok(ftl.geometry().pages_per_block() as u64),
            Ioctl::Trim { start, end } => {
                if start > end || end >= ftl.capacity() as u64 {
                    return Err(StorageError::Parameter(format!(
                        "trim of sectors {}..={} outside device",
                        start, end
                    )));
                }
                retry_once(|| ftl.trim(start as u32..end as u32 + 1)).map(|_| 0)
            }
        })
    }
}
