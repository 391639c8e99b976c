//! Board variant selected by configuration

use super::{Disk, DiskStatus, ImageDisk, Ioctl, NandDisk};
use crate::error::Result;
use crate::nand::NandDevice;
use crate::settings::DiskKind;
use std::path::Path;

/// Either storage medium behind one disk type, so the rest of the stack is
/// built once regardless of the board.
pub enum BoardDisk<N: NandDevice> {
    Nand(NandDisk<N>),
    Image(ImageDisk),
}

impl<N: NandDevice> Clone for BoardDisk<N> {
    fn clone(&self) -> Self {
        match self {
            BoardDisk::Nand(disk) => BoardDisk::Nand(disk.clone()),
            BoardDisk::Image(disk) => BoardDisk::Image(disk.clone()),
        }
    }
}

impl<N: NandDevice + 'static> BoardDisk<N> {
    /// Build the disk named by `kind`. The image is opened if present and
    /// created with `image_sectors` sectors otherwise; the chip is ignored on
    /// image boards.
    pub fn select(
        kind: DiskKind,
        chip: N,
        image_path: impl AsRef<Path>,
        image_sectors: u64,
    ) -> Result<Self> {
        Ok(match kind {
            DiskKind::Nand => BoardDisk::Nand(NandDisk::new(chip)),
            DiskKind::Image => {
                let path = image_path.as_ref();
                let image = if path.exists() {
                    ImageDisk::open(path)?
                } else {
                    ImageDisk::create(path, image_sectors)?
                };
                BoardDisk::Image(image)
            }
        })
    }

    pub fn kind(&self) -> DiskKind {
        match self {
            BoardDisk::Nand(_) => DiskKind::Nand,
            BoardDisk::Image(_) => DiskKind::Image,
        }
    }
}

impl<N: NandDevice + 'static> Disk for BoardDisk<N> {
    fn initialize(&self) -> Result<DiskStatus> {
        match self {
            BoardDisk::Nand(disk) => disk.initialize(),
            BoardDisk::Image(disk) => disk.initialize(),
        }
    }

    fn status(&self) -> DiskStatus {
        match self {
            BoardDisk::Nand(disk) => disk.status(),
            BoardDisk::Image(disk) => disk.status(),
        }
    }

    fn read_sectors(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        match self {
            BoardDisk::Nand(disk) => disk.read_sectors(start, count, buf),
            BoardDisk::Image(disk) => disk.read_sectors(start, count, buf),
        }
    }

    fn write_sectors(&self, start: u64, count: usize, data: &[u8]) -> Result<()> {
        match self {
            BoardDisk::Nand(disk) => disk.write_sectors(start, count, data),
            BoardDisk::Image(disk) => disk.write_sectors(start, count, data),
        }
    }

    fn ioctl(&self, cmd: Ioctl) -> Result<u64> {
        match self {
            BoardDisk::Nand(disk) => disk.ioctl(cmd),
            BoardDisk::Image(disk) => disk.ioctl(cmd),
        }
    }
}
