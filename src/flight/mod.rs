//! Flight file manager
//!
//! Owns the mounted filesystem and the files of the current flight. Opening a
//! flight lists existing flight sets, evicts the oldest until the new set fits
//! inside the retention count, then creates one file per recorded stream and
//! writes its header.

pub mod naming;
pub mod retention;

pub use naming::{FlightKey, FlightNaming, Layout, RotationScheme, Stream};
pub use retention::RetentionPlan;

use crate::disk::Disk;
use crate::error::{Result, StorageError};
use crate::fs::{catalog, EntryKind, FileHandle, FileSystem};
use crate::settings::StorageSettings;
use crate::writer::frame;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Length of the header at the start of every flight file
pub const HEADER_LEN: usize = 64;

/// Format identifier written into each header, zero padded
pub const FORMAT_SPECIFIER: &str = "flight-storage pb3 v1\n";

/// The fixed header block.
pub fn file_header() -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    let id = FORMAT_SPECIFIER.as_bytes();
    let n = id.len().min(HEADER_LEN);
    header[..n].copy_from_slice(&id[..n]);
    header
}

type DateSource = Box<dyn Fn() -> NaiveDate + Send>;

/// Free/total space of the mounted volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceReport {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl SpaceReport {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes - self.free_bytes
    }
}

impl fmt::Display for SpaceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} free of {} ({} used)",
            format_bytes(self.free_bytes),
            format_bytes(self.total_bytes),
            format_bytes(self.used_bytes())
        )
    }
}

/// Human-readable byte count with binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub struct FileManager<D: Disk> {
    disk: D,
    fs: Option<FileSystem<D>>,
    naming: FlightNaming,
    retain: usize,
    layout: Layout,
    data_dir: String,
    max_frame_len: usize,
    label: String,
    current: Option<FlightKey>,
    last: Option<FlightKey>,
    handles: BTreeMap<Stream, FileHandle>,
    today: DateSource,
}

impl<D: Disk> FileManager<D> {
    pub fn new(disk: D, settings: &StorageSettings) -> Result<Self> {
        settings.validate()?;
        Ok(FileManager {
            disk,
            fs: None,
            naming: FlightNaming::new(settings.rotation)?,
            retain: settings.retain_flights as usize,
            layout: settings.layout,
            data_dir: catalog::normalize(&settings.data_dir)?,
            max_frame_len: settings.max_frame_len,
            label: settings.volume_label.clone(),
            current: None,
            last: None,
            handles: BTreeMap::new(),
            today: Box::new(|| chrono::Utc::now().date_naive()),
        })
    }

    /// Replace the calendar used for date-sequence keys.
    pub fn set_date_source<F>(&mut self, today: F)
    where
        F: Fn() -> NaiveDate + Send + 'static,
    {
        self.today = Box::new(today);
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    pub fn is_mounted(&self) -> bool {
        self.fs.is_some()
    }

    /// Mount the volume (formatting a blank one) and create the data
    /// directories.
    pub fn mount(&mut self) -> Result<()> {
        if self.fs.is_some() {
            return Ok(());
        }
        let mut fs = FileSystem::mount_or_format(self.disk.clone(), &self.label)?;
        for dir in self.layout.directories(&self.data_dir) {
            match fs.mkdir(&dir) {
                Ok(()) | Err(StorageError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!("Storage mounted, {}", space_of(&fs));
        self.fs = Some(fs);
        Ok(())
    }

    /// Close every flight file and release the mount.
    pub fn unmount(&mut self) -> Result<()> {
        let closed = self.close();
        if let Some(fs) = self.fs.take() {
            fs.unmount()?;
            info!("Storage unmounted");
        }
        closed
    }

    pub fn filesystem(&mut self) -> Result<&mut FileSystem<D>> {
        self.fs
            .as_mut()
            .ok_or_else(|| StorageError::State("filesystem not mounted".into()))
    }

    pub fn current_flight(&self) -> Option<FlightKey> {
        self.current
    }

    /// Flight keys present on disk, oldest first.
    pub fn list_flights(&self) -> Result<Vec<FlightKey>> {
        Ok(self.present_keys()?.into_iter().collect())
    }

    fn present_keys(&self) -> Result<BTreeSet<FlightKey>> {
        let dirs: BTreeSet<String> = Stream::ALL
            .iter()
            .map(|s| self.layout.directory(&self.data_dir, *s))
            .collect();
        let fs = self
            .fs
            .as_ref()
            .ok_or_else(|| StorageError::State("filesystem not mounted".into()))?;

        let mut keys = BTreeSet::new();
        for dir in dirs {
            for entry in fs.read_dir(&dir)? {
                if entry.kind != EntryKind::File {
                    continue;
                }
                if let Some((_, key)) = self.naming.parse(&entry.name) {
                    keys.insert(key);
                }
            }
        }
        Ok(keys)
    }

    pub fn path_of(&self, stream: Stream, key: FlightKey) -> String {
        catalog::join(
            &self.layout.directory(&self.data_dir, stream),
            &self.naming.file_name(stream, key),
        )
    }

    /// Apply retention and open a new flight file set.
    pub fn open_flight(&mut self) -> Result<FlightKey> {
        if frame::encoded_len(self.max_frame_len) > frame::ENCODE_BUFFER_LEN {
            return Err(StorageError::Data(format!(
                "frames of {} bytes do not fit the {} byte encode buffer",
                self.max_frame_len,
                frame::ENCODE_BUFFER_LEN
            )));
        }
        if self.current.is_some() {
            self.close()?;
        }

        let present = self.present_keys()?;
        let plan = match self.naming.scheme() {
            RotationScheme::Suffix => {
                let suffixes = present
                    .iter()
                    .filter_map(|k| match k {
                        FlightKey::Suffix(n) => Some(*n),
                        FlightKey::Dated { .. } => None,
                    })
                    .collect();
                retention::plan_suffix(&suffixes, self.retain)
            }
            RotationScheme::DateSequence => {
                retention::plan_dated(&present, self.retain, (self.today)())
            }
        };

        for key in &plan.evict {
            self.remove_flight(*key)?;
        }

        let key = plan.next;
        let header = file_header();
        for stream in Stream::RECORDED {
            let path = self.path_of(stream, key);
            let fs = self.filesystem()?;
            let handle = fs.create(&path)?;
            self.handles.insert(stream, handle);
            self.write_all(handle, &header)?;
        }
        self.flush()?;

        info!("Opened flight {} ({} evicted)", key, plan.evict.len());
        self.current = Some(key);
        self.last = Some(key);
        Ok(key)
    }

    /// Delete every file of one flight.
    pub fn remove_flight(&mut self, key: FlightKey) -> Result<()> {
        for stream in Stream::ALL {
            let path = self.path_of(stream, key);
            let fs = self.filesystem()?;
            if fs.exists(&path) {
                fs.remove(&path)?;
            }
        }
        info!("Evicted flight {}", key);
        Ok(())
    }

    /// Append to a stream of the current flight.
    pub fn write(&mut self, stream: Stream, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(StorageError::Data(format!("empty write to {} stream", stream)));
        }
        let handle = *self
            .handles
            .get(&stream)
            .ok_or_else(|| StorageError::State(format!("{} stream not open", stream)))?;
        self.write_all(handle, data)
    }

    fn write_all(&mut self, handle: FileHandle, data: &[u8]) -> Result<()> {
        let written = self.filesystem()?.write(handle, data)?;
        if written < data.len() {
            return Err(StorageError::Hardware(format!(
                "short write: {} of {} bytes",
                written,
                data.len()
            )));
        }
        Ok(())
    }

    /// Sync every open flight file under one metadata commit. A no-op when
    /// nothing is open.
    pub fn flush(&mut self) -> Result<()> {
        let Some(fs) = self.fs.as_mut() else {
            return Ok(());
        };
        if self.handles.is_empty() {
            return Ok(());
        }
        let handles: Vec<FileHandle> = self.handles.values().copied().collect();
        fs.sync_all(&handles)
    }

    /// Close the current flight's files.
    pub fn close(&mut self) -> Result<()> {
        let handles = std::mem::take(&mut self.handles);
        self.current = None;
        let Some(fs) = self.fs.as_mut() else {
            return Ok(());
        };
        let mut result = Ok(());
        for (stream, handle) in handles {
            if let Err(e) = fs.close(handle) {
                warn!("Closing {} stream failed: {}", stream, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Remount if needed and start a fresh flight.
    pub fn reopen(&mut self) -> Result<FlightKey> {
        self.mount()?;
        self.open_flight()
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        self.filesystem()?.read_to_end(path)
    }

    /// Replace a whole file, creating missing parent directories.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let path = catalog::normalize(path)?;
        let fs = self.filesystem()?;

        let mut missing = Vec::new();
        let mut dir = catalog::parent(&path);
        while let Some(d) = dir {
            if fs.exists(d) {
                break;
            }
            missing.push(d.to_string());
            dir = catalog::parent(d);
        }
        for d in missing.iter().rev() {
            debug!("Creating directory {}", d);
            fs.mkdir(d)?;
        }

        let handle = fs.create(&path)?;
        let written = match fs.write(handle, data) {
            Ok(n) => n,
            Err(e) => {
                let _ = fs.close(handle);
                return Err(e);
            }
        };
        fs.close(handle)?;
        if written < data.len() {
            return Err(StorageError::Hardware(format!(
                "short write to {}: {} of {} bytes",
                path,
                written,
                data.len()
            )));
        }
        Ok(())
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        self.filesystem()?.remove(path)
    }

    pub fn space(&mut self) -> Result<SpaceReport> {
        Ok(space_of(self.filesystem()?))
    }

    /// Append a timestamped performance dump to `prf_<key>.txt` of the
    /// current (or most recent) flight.
    ///
    /// Returns the byte counter as the board firmware kept it: each write
    /// overwrites the counter with its own length and then adds its status
    /// code, so only the final write is counted. An empty `stats` therefore
    /// reports failure even though the timestamp was written.
    pub fn dump_perf_stats(&mut self, uptime_ms: u64, stats: &str) -> Result<usize> {
        let key = self
            .current
            .or(self.last)
            .ok_or_else(|| StorageError::State("no flight opened yet".into()))?;
        let path = self.path_of(Stream::Perf, key);
        let fs = self.filesystem()?;

        let fresh = !fs.exists(&path);
        let handle = fs.open_append(&path)?;
        let result = (|| -> Result<usize> {
            if fresh {
                fs.write(handle, &file_header())?;
            }
            let timestamp = format!("{} ms:\n", uptime_ms);
            let mut bw = 0;
            for chunk in [timestamp.as_bytes(), stats.as_bytes()] {
                // Replaces the running count instead of adding to it.
                bw = fs.write(handle, chunk)?;
            }
            Ok(bw)
        })();
        fs.close(handle)?;

        let bw = result?;
        if bw == 0 {
            return Err(StorageError::Hardware("nothing written to perf dump".into()));
        }
        debug!("Wrote perf dump to {}", path);
        Ok(bw)
    }
}

fn space_of<D: Disk>(fs: &FileSystem<D>) -> SpaceReport {
    SpaceReport {
        total_bytes: fs.total_space(),
        free_bytes: fs.free_space(),
    }
}
