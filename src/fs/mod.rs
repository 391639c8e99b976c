//! Hierarchical filesystem on top of a [`Disk`]
//!
//! Volume layout: superblock in sector 0, two alternating metadata slots,
//! then the data region. File content is written sector by sector as it
//! arrives; the catalog only becomes durable at a metadata commit (`sync`,
//! `close`, and every namespace change). After a power loss the volume mounts
//! at the last committed generation.
//!
//! Each writer reserves a run of sectors (at least [`MIN_CHUNK_SECTORS`], a
//! multiple of the erase block) and fills it before allocating again, so
//! interleaved streams still get long extents. Unused reservations are
//! returned on `close` and are never committed.
//!
//! Sectors released by `remove` or a truncating `create` stay allocated until
//! the next commit so the committed generation never points at reused
//! sectors; they are trimmed afterwards.

pub mod allocator;
pub mod catalog;
pub mod meta;
pub mod superblock;

pub use catalog::{FileMetadata, FileType};
pub use superblock::Superblock;

use crate::disk::{Disk, DiskStatus, Ioctl};
use crate::error::{Result, StorageError};
use allocator::BitmapAllocator;
use catalog::Catalog;
use std::collections::HashMap;
use std::ops::Range;
use tracing::{debug, info, warn};

/// Smallest run of sectors a writer reserves at once.
pub const MIN_CHUNK_SECTORS: u64 = 16;

/// Opaque handle to an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Open for appending, creating the file if missing
    Append,
    /// Create or truncate, then write
    Create,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

struct OpenFile {
    path: String,
    mode: OpenMode,
    /// Read position
    cursor: u64,
    /// Bytes of the file in completed sectors
    full_len: u64,
    /// Bytes past `full_len` not yet filling a sector
    pending: Vec<u8>,
    /// Allocated sectors not yet part of the file
    reserve: Range<u64>,
}

impl OpenFile {
    fn is_writer(&self) -> bool {
        self.mode != OpenMode::Read
    }
}

pub struct FileSystem<D: Disk> {
    disk: D,
    superblock: Superblock,
    sector_size: usize,
    catalog: Catalog,
    allocator: BitmapAllocator,
    generation: u64,
    open: HashMap<u32, OpenFile>,
    next_handle: u32,
    pending_free: Vec<u64>,
    chunk_sectors: u64,
}

fn ensure_ready<D: Disk>(disk: &D) -> Result<()> {
    match disk.status() {
        DiskStatus::Ready | DiskStatus::Busy => Ok(()),
        DiskStatus::NotInitialized | DiskStatus::NoDisk => match disk.initialize()? {
            DiskStatus::Ready => Ok(()),
            status => Err(StorageError::Hardware(format!("disk not ready: {:?}", status))),
        },
    }
}

/// Reservation size: whole erase blocks, at least [`MIN_CHUNK_SECTORS`].
fn chunk_sectors(block_sectors: u64) -> u64 {
    let block = block_sectors.max(1);
    block * MIN_CHUNK_SECTORS.div_ceil(block)
}

impl<D: Disk> FileSystem<D> {
    /// Write an empty volume.
    pub fn format(disk: &D, label: &str) -> Result<()> {
        ensure_ready(disk)?;
        let sector_size = disk.sector_size()?;
        let total = disk.sector_count()?;
        let superblock = Superblock::new(sector_size as u32, total, label)?;

        // Superblock goes last so a torn format never looks valid.
        let blank = vec![0u8; sector_size];
        disk.write_sectors(superblock.meta_slot_start(0), 1, &blank)?;
        meta::write_slot(disk, &superblock, 1, &Catalog::new())?;
        disk.write_sectors(0, 1, &superblock.to_bytes())?;
        if let Err(e) = disk.trim(superblock.data_start, total) {
            warn!("Trim of data region after format failed: {}", e);
        }
        disk.sync()?;

        info!(
            "Formatted volume {:?}: {} data sectors of {} bytes",
            label,
            superblock.data_sectors(),
            sector_size
        );
        Ok(())
    }

    /// Mount an existing volume.
    ///
    /// A blank or corrupt volume is [`StorageError::NoFilesystem`].
    pub fn mount(disk: D) -> Result<Self> {
        ensure_ready(&disk)?;
        let sector_size = disk.sector_size()?;
        let mut sector = vec![0u8; sector_size];
        disk.read_sectors(0, 1, &mut sector)?;

        let superblock = Superblock::from_bytes(&sector)?;
        if superblock.sector_size as usize != sector_size
            || superblock.total_sectors > disk.sector_count()?
        {
            warn!("Volume geometry does not match the device");
            return Err(StorageError::NoFilesystem);
        }

        let mut best: Option<(u64, meta::VolumeState)> = None;
        for slot in 0..2 {
            if let Some((generation, state)) = meta::read_slot(&disk, &superblock, slot)? {
                if best.as_ref().map_or(true, |(g, _)| generation > *g) {
                    best = Some((generation, state));
                }
            }
        }
        let (generation, state) = best.ok_or(StorageError::NoFilesystem)?;
        let chunk_sectors = chunk_sectors(disk.ioctl(Ioctl::GetBlockSize)?);

        info!(
            "Mounted volume {:?} at generation {}: {} entries, {} free sectors",
            superblock.label(),
            generation,
            state.catalog.len(),
            state.allocator.free_count()
        );

        Ok(FileSystem {
            disk,
            superblock,
            sector_size,
            catalog: state.catalog,
            allocator: state.allocator,
            generation,
            open: HashMap::new(),
            next_handle: 1,
            pending_free: Vec::new(),
            chunk_sectors,
        })
    }

    /// Mount, formatting once if the device holds no valid volume.
    pub fn mount_or_format(disk: D, label: &str) -> Result<Self> {
        match Self::mount(disk.clone()) {
            Err(StorageError::NoFilesystem) => {
                warn!("No filesystem found, formatting");
                Self::format(&disk, label)?;
                Self::mount(disk)
            }
            other => other,
        }
    }

    /// Close every handle, commit and hand the disk back.
    pub fn unmount(mut self) -> Result<D> {
        let handles: Vec<u32> = self.open.keys().copied().collect();
        for handle in handles {
            self.close(FileHandle(handle))?;
        }
        self.commit()?;
        self.disk.sync()?;
        debug!("Unmounted at generation {}", self.generation);
        Ok(self.disk)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn open_handles(&self) -> usize {
        self.open.len()
    }

    /// Free bytes, counting sectors reserved by open writers as free.
    pub fn free_space(&self) -> u64 {
        let reserved: u64 = self
            .open
            .values()
            .map(|f| f.reserve.end - f.reserve.start)
            .sum();
        (self.allocator.free_count() + reserved) * self.sector_size as u64
    }

    pub fn total_space(&self) -> u64 {
        self.superblock.data_sectors() * self.sector_size as u64
    }

    pub fn exists(&self, path: &str) -> bool {
        catalog::normalize(path)
            .map(|p| p == "/" || self.catalog.get(&p).is_some())
            .unwrap_or(false)
    }

    pub fn stat(&self, path: &str) -> Result<DirEntry> {
        let path = catalog::normalize(path)?;
        if path == "/" {
            return Ok(DirEntry {
                name: String::from("/"),
                kind: EntryKind::Directory,
                size: 0,
            });
        }
        let meta = self
            .catalog
            .get(&path)
            .ok_or_else(|| StorageError::NotFound(path.clone()))?;
        Ok(entry(catalog::file_name(&path), meta))
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let path = catalog::normalize(path)?;
        if path == "/" || self.catalog.get(&path).is_some() {
            return Err(StorageError::AlreadyExists(path));
        }
        self.check_parent(&path)?;
        self.catalog.insert(path, FileMetadata::directory());
        self.commit()
    }

    /// Direct children of a directory, in name order.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = catalog::normalize(path)?;
        if !self.catalog.is_dir(&path) {
            return Err(StorageError::NotFound(path));
        }
        Ok(self
            .catalog
            .children(&path)
            .map(|(name, meta)| entry(name, meta))
            .collect())
    }

    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        let path = catalog::normalize(path)?;

        if mode != OpenMode::Read && self.writer_for(&path).is_some() {
            return Err(StorageError::State(format!("{} already open for writing", path)));
        }

        match (self.catalog.get(&path), mode) {
            (Some(meta), _) if meta.is_dir() => {
                return Err(StorageError::Parameter(format!("{} is a directory", path)));
            }
            (None, OpenMode::Read) => return Err(StorageError::NotFound(path)),
            (None, _) => {
                self.check_parent(&path)?;
                self.catalog.insert(path.clone(), FileMetadata::file());
            }
            (Some(_), OpenMode::Create) => {
                if self.readers_for(&path) > 0 {
                    return Err(StorageError::State(format!("{} is open for reading", path)));
                }
                if let Some(meta) = self.catalog.get_mut(&path) {
                    let released = meta.truncate();
                    self.pending_free.extend(released);
                }
            }
            (Some(_), _) => {}
        }

        let size = self.catalog.get(&path).map_or(0, |m| m.size);
        let ss = self.sector_size as u64;
        let (full_len, pending) = if mode == OpenMode::Read || size % ss == 0 {
            (size - size % ss, Vec::new())
        } else {
            let full_len = size - size % ss;
            let mut tail = vec![0u8; self.sector_size];
            let sector = self
                .catalog
                .get(&path)
                .and_then(|m| m.sector_at(full_len / ss))
                .ok_or_else(|| StorageError::Data(format!("{} is missing its last sector", path)))?;
            self.disk
                .read_sectors(self.superblock.data_start + sector, 1, &mut tail)?;
            tail.truncate((size % ss) as usize);
            (full_len, tail)
        };

        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.open.insert(
            handle,
            OpenFile {
                path,
                mode,
                cursor: 0,
                full_len,
                pending,
                reserve: 0..0,
            },
        );
        Ok(FileHandle(handle))
    }

    pub fn create(&mut self, path: &str) -> Result<FileHandle> {
        self.open(path, OpenMode::Create)
    }

    pub fn open_append(&mut self, path: &str) -> Result<FileHandle> {
        self.open(path, OpenMode::Append)
    }

    pub fn open_read(&mut self, path: &str) -> Result<FileHandle> {
        self.open(path, OpenMode::Read)
    }

    /// Append bytes; returns the number of bytes accepted.
    pub fn write(&mut self, handle: FileHandle, data: &[u8]) -> Result<usize> {
        let mut file = self.take_handle(handle)?;
        let result = self.write_inner(&mut file, data);
        self.open.insert(handle.0, file);
        result
    }

    fn write_inner(&mut self, file: &mut OpenFile, data: &[u8]) -> Result<usize> {
        if !file.is_writer() {
            return Err(StorageError::State(format!("{} opened read-only", file.path)));
        }

        // A failed sector write leaves the handle as it was before the call,
        // so retrying the same bytes never stores them twice.
        let buffered = file.pending.len();
        file.pending.extend_from_slice(data);
        let ss = self.sector_size;
        let mut stored = 0;
        while file.pending.len() - stored >= ss {
            let index = (file.full_len + stored as u64) / ss as u64;
            let sector = &file.pending[stored..stored + ss];
            if let Err(e) = self.store_sector(&file.path, &mut file.reserve, index, sector) {
                file.pending.truncate(buffered);
                return Err(e);
            }
            stored += ss;
        }

        if stored > 0 {
            file.pending.drain(..stored);
            file.full_len += stored as u64;
            if let Some(meta) = self.catalog.get_mut(&file.path) {
                meta.size = meta.size.max(file.full_len);
                meta.touch();
            }
        }
        Ok(data.len())
    }

    /// Read from the current position; returns bytes read, 0 at end of file.
    pub fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let file = self
            .open
            .get_mut(&handle.0)
            .ok_or_else(|| StorageError::State("handle not open".into()))?;
        if file.is_writer() {
            return Err(StorageError::State(format!("{} opened for writing", file.path)));
        }
        let meta = self
            .catalog
            .get(&file.path)
            .ok_or_else(|| StorageError::NotFound(file.path.clone()))?;

        let ss = self.sector_size as u64;
        let mut sector_buf = vec![0u8; self.sector_size];
        let mut done = 0;
        while done < buf.len() && file.cursor < meta.size {
            let index = file.cursor / ss;
            let offset = (file.cursor % ss) as usize;
            let sector = meta
                .sector_at(index)
                .ok_or_else(|| StorageError::Data(format!("{} shorter than its size", file.path)))?;
            self.disk
                .read_sectors(self.superblock.data_start + sector, 1, &mut sector_buf)?;

            let n = (self.sector_size - offset)
                .min(buf.len() - done)
                .min((meta.size - file.cursor) as usize);
            buf[done..done + n].copy_from_slice(&sector_buf[offset..offset + n]);
            done += n;
            file.cursor += n as u64;
        }
        Ok(done)
    }

    /// Read a whole file.
    pub fn read_to_end(&mut self, path: &str) -> Result<Vec<u8>> {
        let handle = self.open_read(path)?;
        let mut content = Vec::new();
        let mut chunk = vec![0u8; self.sector_size];
        let result = loop {
            match self.read(handle, &mut chunk) {
                Ok(0) => break Ok(()),
                Ok(n) => content.extend_from_slice(&chunk[..n]),
                Err(e) => break Err(e),
            }
        };
        self.close(handle)?;
        result.map(|()| content)
    }

    /// Persist buffered bytes of a handle and commit metadata.
    pub fn sync(&mut self, handle: FileHandle) -> Result<()> {
        self.sync_all(&[handle])
    }

    /// Persist buffered bytes of several handles under a single commit.
    pub fn sync_all(&mut self, handles: &[FileHandle]) -> Result<()> {
        let mut writers = 0;
        for &handle in handles {
            let mut file = self.take_handle(handle)?;
            let result = self.flush_tail(&mut file);
            if file.is_writer() {
                writers += 1;
            }
            self.open.insert(handle.0, file);
            result?;
        }
        if writers > 0 {
            self.commit()?;
        }
        Ok(())
    }

    /// Write the partial last sector and bring the catalog size up to date.
    fn flush_tail(&mut self, file: &mut OpenFile) -> Result<()> {
        if !file.is_writer() {
            return Ok(());
        }
        if !file.pending.is_empty() {
            let mut sector = file.pending.clone();
            sector.resize(self.sector_size, 0);
            let index = file.full_len / self.sector_size as u64;
            self.store_sector(&file.path, &mut file.reserve, index, &sector)?;
        }
        if let Some(meta) = self.catalog.get_mut(&file.path) {
            meta.size = file.full_len + file.pending.len() as u64;
            meta.touch();
        }
        Ok(())
    }

    pub fn close(&mut self, handle: FileHandle) -> Result<()> {
        let mut file = self.take_handle(handle)?;
        if !file.is_writer() {
            return Ok(());
        }
        let flushed = self.flush_tail(&mut file);
        self.release_reservation(&mut file);
        flushed?;
        self.commit()
    }

    fn release_reservation(&mut self, file: &mut OpenFile) {
        let unused: Vec<u64> = std::mem::replace(&mut file.reserve, 0..0).collect();
        if let Err(e) = self.allocator.release(&unused) {
            warn!("Releasing reservation of {} failed: {}", file.path, e);
        }
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let from = catalog::normalize(from)?;
        let to = catalog::normalize(to)?;
        if self.catalog.get(&from).is_none() {
            return Err(StorageError::NotFound(from));
        }
        if to == "/" || self.catalog.get(&to).is_some() {
            return Err(StorageError::AlreadyExists(to));
        }
        if to.starts_with(&format!("{}/", from)) {
            return Err(StorageError::Parameter(format!(
                "cannot move {} into itself",
                from
            )));
        }
        self.check_parent(&to)?;
        if self.is_open_under(&from) {
            return Err(StorageError::State(format!("{} is open", from)));
        }

        self.catalog.rename(&from, &to);
        self.commit()
    }

    /// Delete a file or an empty directory.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let path = catalog::normalize(path)?;
        let meta = self
            .catalog
            .get(&path)
            .ok_or_else(|| StorageError::NotFound(path.clone()))?;
        if meta.is_dir() && self.catalog.children(&path).next().is_some() {
            return Err(StorageError::State(format!("{} is not empty", path)));
        }
        if self.is_open_under(&path) {
            return Err(StorageError::State(format!("{} is open", path)));
        }

        if let Some(meta) = self.catalog.remove(&path) {
            self.pending_free.extend(meta.sectors());
        }
        self.commit()
    }

    /// Write the catalog as the next metadata generation.
    pub fn commit(&mut self) -> Result<()> {
        let generation = self.generation + 1;
        meta::write_slot(&self.disk, &self.superblock, generation, &self.catalog)?;
        self.disk.sync()?;
        self.generation = generation;

        let mut freed = std::mem::take(&mut self.pending_free);
        if !freed.is_empty() {
            self.allocator.release(&freed)?;
            self.trim_sectors(&mut freed);
        }
        Ok(())
    }

    fn trim_sectors(&self, sectors: &mut [u64]) {
        sectors.sort_unstable();
        let base = self.superblock.data_start;
        let mut runs: Vec<(u64, u64)> = Vec::new();
        for &s in sectors.iter() {
            match runs.last_mut() {
                Some((_, end)) if *end == s => *end += 1,
                _ => runs.push((s, s + 1)),
            }
        }
        for (start, end) in runs {
            if let Err(e) = self.disk.trim(base + start, base + end) {
                warn!("Trim of sectors {}..{} failed: {}", start, end, e);
            }
        }
    }

    /// Write the `index`-th sector of a file, taking a new sector from the
    /// writer's reservation when the file does not reach that far yet.
    fn store_sector(
        &mut self,
        path: &str,
        reserve: &mut Range<u64>,
        index: u64,
        data: &[u8],
    ) -> Result<()> {
        let meta = self
            .catalog
            .get_mut(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        let sector = match meta.sector_at(index) {
            Some(sector) => sector,
            None => {
                let sector = match reserve.next() {
                    Some(sector) => sector,
                    None => {
                        let hint = meta.last_sector().map(|s| s + 1);
                        let (start, len) = self.allocator.allocate_run(self.chunk_sectors, hint)?;
                        *reserve = start + 1..start + len;
                        start
                    }
                };
                meta.push_sector(sector);
                sector
            }
        };
        self.disk
            .write_sectors(self.superblock.data_start + sector, 1, data)
    }

    fn take_handle(&mut self, handle: FileHandle) -> Result<OpenFile> {
        self.open
            .remove(&handle.0)
            .ok_or_else(|| StorageError::State("handle not open".into()))
    }

    fn check_parent(&self, path: &str) -> Result<()> {
        let parent = catalog::parent(path).unwrap_or("/");
        if !self.catalog.is_dir(parent) {
            return Err(StorageError::NotFound(parent.to_string()));
        }
        Ok(())
    }

    fn writer_for(&self, path: &str) -> Option<u32> {
        self.open
            .iter()
            .find(|(_, f)| f.is_writer() && f.path == path)
            .map(|(h, _)| *h)
    }

    fn readers_for(&self, path: &str) -> usize {
        self.open
            .values()
            .filter(|f| !f.is_writer() && f.path == path)
            .count()
    }

    fn is_open_under(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.open
            .values()
            .any(|f| f.path == path || f.path.starts_with(&prefix))
    }
}

fn entry(name: &str, meta: &FileMetadata) -> DirEntry {
    DirEntry {
        name: name.to_string(),
        kind: if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        size: meta.size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::NandDisk;
    use crate::nand::{Geometry, SimNand};

    fn disk() -> NandDisk<SimNand> {
        NandDisk::new(SimNand::new(Geometry::small(32)))
    }

    fn mounted() -> FileSystem<NandDisk<SimNand>> {
        FileSystem::mount_or_format(disk(), "TEST").unwrap()
    }

    #[test]
    fn test_blank_disk_has_no_filesystem() {
        assert!(matches!(
            FileSystem::mount(disk()),
            Err(StorageError::NoFilesystem)
        ));
    }

    #[test]
    fn test_format_then_mount() {
        let disk = disk();
        let fs = FileSystem::mount_or_format(disk.clone(), "TEST").unwrap();
        assert_eq!(fs.superblock().label(), "TEST");
        assert_eq!(fs.free_space(), fs.total_space());
        fs.unmount().unwrap();

        let fs = FileSystem::mount(disk).unwrap();
        assert!(fs.read_dir("/").unwrap().is_empty());
    }

    #[test]
    fn test_append_and_read_back() {
        let mut fs = mounted();
        let h = fs.create("/a.bin").unwrap();
        let data: Vec<u8> = (0..1300).map(|i| (i % 256) as u8).collect();
        assert_eq!(fs.write(h, &data[..700]).unwrap(), 700);
        assert_eq!(fs.write(h, &data[700..]).unwrap(), 600);
        fs.close(h).unwrap();

        assert_eq!(fs.read_to_end("/a.bin").unwrap(), data);
        assert_eq!(fs.stat("/a.bin").unwrap().size, 1300);
    }

    #[test]
    fn test_append_after_reopen_extends_partial_sector() {
        let mut fs = mounted();
        let h = fs.open_append("/log.txt").unwrap();
        fs.write(h, b"hello ").unwrap();
        fs.close(h).unwrap();

        let h = fs.open_append("/log.txt").unwrap();
        fs.write(h, b"world").unwrap();
        fs.close(h).unwrap();

        assert_eq!(fs.read_to_end("/log.txt").unwrap(), b"hello world");
    }

    #[test]
    fn test_single_writer_per_path() {
        let mut fs = mounted();
        let _h = fs.create("/x").unwrap();
        assert!(matches!(fs.open_append("/x"), Err(StorageError::State(_))));
        assert!(matches!(fs.remove("/x"), Err(StorageError::State(_))));
    }

    #[test]
    fn test_unsynced_tail_lost_on_power_loss() {
        let disk = disk();
        let mut fs = FileSystem::mount_or_format(disk.clone(), "TEST").unwrap();
        let h = fs.create("/f").unwrap();
        fs.write(h, b"durable").unwrap();
        fs.sync(h).unwrap();
        fs.write(h, b" volatile").unwrap();
        // Power loss: drop without closing.
        drop(fs);

        let mut fs = FileSystem::mount(disk).unwrap();
        assert_eq!(fs.read_to_end("/f").unwrap(), b"durable");
    }

    #[test]
    fn test_directories() {
        let mut fs = mounted();
        fs.mkdir("/gps").unwrap();
        assert!(matches!(fs.mkdir("/gps"), Err(StorageError::AlreadyExists(_))));
        assert!(matches!(fs.create("/none/f"), Err(StorageError::NotFound(_))));

        let h = fs.create("/gps/gps_00.pb3").unwrap();
        fs.write(h, &[1, 2, 3]).unwrap();
        fs.close(h).unwrap();

        let entries = fs.read_dir("/gps").unwrap();
        assert_eq!(
            entries,
            vec![DirEntry {
                name: "gps_00.pb3".into(),
                kind: EntryKind::File,
                size: 3
            }]
        );
        assert!(matches!(fs.remove("/gps"), Err(StorageError::State(_))));
    }

    #[test]
    fn test_remove_frees_space_after_commit() {
        let mut fs = mounted();
        let before = fs.free_space();
        let h = fs.create("/big").unwrap();
        fs.write(h, &vec![7u8; 4096]).unwrap();
        fs.close(h).unwrap();
        assert_eq!(fs.free_space(), before - 4096);

        fs.remove("/big").unwrap();
        assert_eq!(fs.free_space(), before);
        assert!(!fs.exists("/big"));
    }

    #[test]
    fn test_rename() {
        let mut fs = mounted();
        let h = fs.create("/old").unwrap();
        fs.write(h, b"payload").unwrap();
        fs.close(h).unwrap();
        fs.mkdir("/dir").unwrap();

        fs.rename("/old", "/dir/new").unwrap();
        assert!(!fs.exists("/old"));
        assert_eq!(fs.read_to_end("/dir/new").unwrap(), b"payload");
        assert!(matches!(fs.rename("/missing", "/x"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_create_truncates() {
        let mut fs = mounted();
        let h = fs.create("/t").unwrap();
        fs.write(h, &[1u8; 1000]).unwrap();
        fs.close(h).unwrap();

        let h = fs.create("/t").unwrap();
        fs.write(h, b"x").unwrap();
        fs.close(h).unwrap();
        assert_eq!(fs.read_to_end("/t").unwrap(), b"x");
    }

    #[test]
    fn test_out_of_space() {
        let mut fs = mounted();
        let h = fs.create("/fill").unwrap();
        let chunk = vec![0u8; 512];
        let mut result = Ok(0);
        for _ in 0..10_000 {
            result = fs.write(h, &chunk);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(StorageError::OutOfSpace)));
    }

    #[test]
    fn test_interleaved_writers_get_long_extents() {
        let disk = disk();
        let mut fs = FileSystem::mount_or_format(disk.clone(), "TEST").unwrap();
        let a = fs.create("/a").unwrap();
        let b = fs.create("/b").unwrap();
        for _ in 0..40 {
            fs.write(a, &[1u8; 512]).unwrap();
            fs.write(b, &[2u8; 512]).unwrap();
        }

        let generation = fs.generation();
        fs.sync_all(&[a, b]).unwrap();
        assert_eq!(fs.generation(), generation + 1);

        for path in ["/a", "/b"] {
            let meta = fs.catalog.get(path).unwrap();
            assert_eq!(meta.sector_count(), 40);
            assert_eq!(meta.extents.len(), 3, "{}: {:?}", path, meta.extents);
        }
        // Reserved but unused sectors still count as free.
        assert_eq!(fs.free_space(), fs.total_space() - 80 * 512);

        fs.close(a).unwrap();
        fs.close(b).unwrap();
        assert_eq!(fs.free_space(), fs.total_space() - 80 * 512);
        fs.unmount().unwrap();

        let mut fs = FileSystem::mount(disk).unwrap();
        assert_eq!(fs.free_space(), fs.total_space() - 80 * 512);
        assert_eq!(fs.read_to_end("/b").unwrap(), vec![2u8; 40 * 512]);
    }

    #[test]
    fn test_failed_write_leaves_handle_unchanged() {
        let nand = SimNand::new(Geometry::small(32));
        let mut fs = FileSystem::mount_or_format(NandDisk::new(nand.clone()), "TEST").unwrap();
        let h = fs.create("/log").unwrap();
        let head = vec![b'a'; 500];
        fs.write(h, &head).unwrap();
        fs.sync(h).unwrap();

        // The line crosses into the second sector, so the first is rewritten.
        let line = b"0123456789abcdefghij";
        nand.stall(1);
        assert!(matches!(fs.write(h, line), Err(StorageError::Timeout(_))));
        assert_eq!(fs.write(h, line).unwrap(), line.len());
        fs.close(h).unwrap();

        let mut expected = head;
        expected.extend_from_slice(line);
        assert_eq!(fs.read_to_end("/log").unwrap(), expected);
    }

    #[test]
    fn test_stale_handle_is_state_error() {
        let mut fs = mounted();
        let h = fs.create("/s").unwrap();
        fs.close(h).unwrap();
        assert!(matches!(fs.write(h, b"x"), Err(StorageError::State(_))));
        assert!(matches!(fs.close(h), Err(StorageError::State(_))));
    }
}
