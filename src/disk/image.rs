//! Sector image file disk
//!
//! Board variant for SD-card storage: the card does its own wear leveling, so
//! sectors go straight to a file (or the card's block device node) with no
//! translation layer in between.

use super::{check_transfer, Disk, DiskStatus, Ioctl};
use crate::error::{Result, StorageError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// SD cards address 512-byte sectors.
pub const SD_SECTOR_SIZE: usize = 512;

/// Card erase unit reported through [`Ioctl::GetBlockSize`].
pub const SD_ERASE_SECTORS: u64 = 8;

struct ImageFile {
    file: File,
    sectors: u64,
    initialized: bool,
}

/// Disk-backed sector image
#[derive(Clone)]
pub struct ImageDisk {
    inner: Arc<Mutex<ImageFile>>,
    path: PathBuf,
}

impl ImageDisk {
    /// Create a zero-filled image of `sectors` sectors
    pub fn create<P: AsRef<Path>>(path: P, sectors: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(sectors * SD_SECTOR_SIZE as u64)?;

        Ok(ImageDisk {
            inner: Arc::new(Mutex::new(ImageFile {
                file,
                sectors,
                initialized: false,
            })),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open an existing image
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len % SD_SECTOR_SIZE as u64 != 0 {
            return Err(StorageError::Data(format!(
                "image size {} is not a multiple of {}",
                len, SD_SECTOR_SIZE
            )));
        }

        Ok(ImageDisk {
            inner: Arc::new(Mutex::new(ImageFile {
                file,
                sectors: len / SD_SECTOR_SIZE as u64,
                initialized: false,
            })),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Get image path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_file<R>(&self, f: impl FnOnce(&mut ImageFile) -> Result<R>) -> Result<R> {
        let mut image = self.inner.lock();
        if !image.initialized {
            return Err(StorageError::State("disk not initialized".into()));
        }
        f(&mut *image)
    }
}

impl Disk for ImageDisk {
    fn initialize(&self) -> Result<DiskStatus> {
        self.inner.lock().initialized = true;
        Ok(DiskStatus::Ready)
    }

    fn status(&self) -> DiskStatus {
        if self.inner.lock().initialized {
            DiskStatus::Ready
        } else {
            DiskStatus::NotInitialized
        }
    }

    fn read_sectors(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        self.with_file(|image| {
            check_transfer(start, count, buf.len(), SD_SECTOR_SIZE, image.sectors)?;
            image
                .file
                .seek(SeekFrom::Start(start * SD_SECTOR_SIZE as u64))?;
            image.file.read_exact(buf)?;
            Ok(())
        })
    }

    fn write_sectors(&self, start: u64, count: usize, data: &[u8]) -> Result<()> {
        self.with_file(|image| {
            check_transfer(start, count, data.len(), SD_SECTOR_SIZE, image.sectors)?;
            image
                .file
                .seek(SeekFrom::Start(start * SD_SECTOR_SIZE as u64))?;
            image.file.write_all(data)?;
            Ok(())
        })
    }

    fn ioctl(&self, cmd: Ioctl) -> Result<u64> {
        self.with_file(|image| match cmd {
            Ioctl::Sync => {
                image.file.flush()?;
                image.file.sync_all()?;
                Ok(0)
            }
            Ioctl::GetSectorCount => Ok(image.sectors),
            Ioctl::GetSectorSize => Ok(SD_SECTOR_SIZE as u64),
            Ioctl::GetBlockSize => Ok(SD_ERASE_SECTORS),
            // The card manages its own erase units.
            Ioctl::Trim { start, end } => {
                if start > end || end >= image.sectors {
                    return Err(StorageError::Parameter(format!(
                        "trim of sectors {}..={} outside device",
                        start, end
                    )));
                }
                Ok(0)
            }
        })
    }
}
