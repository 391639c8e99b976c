//! Storage service
//!
//! Built once at startup. Owns the file manager, the config store and the
//! writer thread, and hands out cloneable handles: [`WriterHandle`] for
//! producers and the pause control, [`ConfigHandle`] for the command shell,
//! and the disk itself for the host mass-storage collaborator.

use crate::config::{BackupMemory, BoardConfig, ConfigSource, ConfigStore, ConfigValue};
use crate::disk::Disk;
use crate::error::{Result, StorageError};
use crate::flight::{FileManager, FlightKey, SpaceReport};
use crate::settings::StorageSettings;
use crate::writer::{Indicator, NoIndicator, PauseReason, StorageWriter, WriterHandle, WriterStats};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

const PERIOD_KEY: &str = "storage_loop_period_ms";

fn period_of(config: &BoardConfig) -> Duration {
    Duration::from_millis(u64::from(config.storage_loop_period_ms).max(1))
}

/// Shared access to the board config
pub struct ConfigHandle<D: Disk, B: BackupMemory> {
    store: Arc<Mutex<ConfigStore<B>>>,
    files: Arc<Mutex<FileManager<D>>>,
    writer: WriterHandle,
}

impl<D: Disk, B: BackupMemory> Clone for ConfigHandle<D, B> {
    fn clone(&self) -> Self {
        ConfigHandle {
            store: Arc::clone(&self.store),
            files: Arc::clone(&self.files),
            writer: self.writer.clone(),
        }
    }
}

impl<D: Disk, B: BackupMemory> ConfigHandle<D, B> {
    pub fn current(&self) -> Result<BoardConfig> {
        self.store.lock().current().copied()
    }

    pub fn source(&self) -> Option<ConfigSource> {
        self.store.lock().source()
    }

    pub fn get_value(&self, key: &str) -> Result<ConfigValue> {
        self.store.lock().get_value(key)
    }

    /// Validate, apply and commit one field. A new storage period takes
    /// effect at the next period boundary.
    pub fn set_value(&self, key: &str, text: &str) -> Result<ConfigValue> {
        let mut store = self.store.lock();
        let value = store.set_value(&mut self.files.lock(), key, text)?;
        if key == PERIOD_KEY {
            self.writer.set_period(period_of(store.current()?));
        }
        Ok(value)
    }

    pub fn commit(&self) -> Result<()> {
        let mut store = self.store.lock();
        let mut files = self.files.lock();
        store.commit(&mut files)
    }

    /// Drop the backup copy and reload from flash, or defaults.
    pub fn reload(&self) -> Result<ConfigSource> {
        let mut store = self.store.lock();
        store.invalidate();
        let source = store.load(&mut self.files.lock())?;
        self.writer.set_period(period_of(store.current()?));
        Ok(source)
    }

    pub fn describe(&self) -> String {
        self.store.lock().describe()
    }
}

pub struct FlightStorage<D: Disk, B: BackupMemory> {
    disk: D,
    files: Arc<Mutex<FileManager<D>>>,
    config: ConfigHandle<D, B>,
    writer: WriterHandle,
    join: Option<JoinHandle<WriterStats>>,
}

impl<D: Disk, B: BackupMemory + 'static> FlightStorage<D, B> {
    /// Mount the volume, load the board config and start recording.
    ///
    /// A volume that cannot be mounted does not fail startup: the config
    /// falls back to defaults and the writer reports the failure through its
    /// state and the indicator. Pausing and resuming retries the mount.
    pub fn start(disk: D, backup: B, settings: &StorageSettings) -> Result<Self> {
        Self::start_with_indicator(disk, backup, settings, NoIndicator)
    }

    pub fn start_with_indicator<I: Indicator + 'static>(
        disk: D,
        backup: B,
        settings: &StorageSettings,
        indicator: I,
    ) -> Result<Self> {
        let mut files = FileManager::new(disk.clone(), settings)?;
        // The writer mounts again when it opens the first flight.
        if let Err(e) = files.mount() {
            error!("Mounting storage at startup failed: {}", e);
        }

        let mut store = ConfigStore::new(backup, settings.config_path.clone());
        let source = store.load(&mut files)?;
        let period = period_of(store.current()?);
        info!("Config from {:?}, storage period {:?}", source, period);

        let files = Arc::new(Mutex::new(files));
        let (writer, handle) = StorageWriter::new(Arc::clone(&files), settings, period);
        let join = writer.with_indicator(indicator).spawn()?;

        Ok(FlightStorage {
            disk,
            config: ConfigHandle {
                store: Arc::new(Mutex::new(store)),
                files: Arc::clone(&files),
                writer: handle.clone(),
            },
            files,
            writer: handle,
            join: Some(join),
        })
    }
}

impl<D: Disk, B: BackupMemory> FlightStorage<D, B> {
    pub fn writer(&self) -> WriterHandle {
        self.writer.clone()
    }

    pub fn config(&self) -> ConfigHandle<D, B> {
        self.config.clone()
    }

    /// Disk handle for the host mass-storage collaborator. Recording should
    /// be paused with [`FlightStorage::attach_host`] while the host owns it.
    pub fn disk(&self) -> D {
        self.disk.clone()
    }

    /// Hand the volume to the host: recording pauses at the next boundary.
    pub fn attach_host(&self) {
        self.writer.pause_for(PauseReason::MassStorage);
    }

    pub fn detach_host(&self) {
        self.writer.resume_for(PauseReason::MassStorage);
    }

    pub fn current_flight(&self) -> Option<FlightKey> {
        self.files.lock().current_flight()
    }

    pub fn list_flights(&self) -> Result<Vec<FlightKey>> {
        self.files.lock().list_flights()
    }

    pub fn space(&self) -> Result<SpaceReport> {
        self.files.lock().space()
    }

    /// Stop the writer, waiting for it to flush and unmount.
    pub fn shutdown(mut self) -> Result<WriterStats> {
        self.stop()
    }

    fn stop(&mut self) -> Result<WriterStats> {
        let Some(join) = self.join.take() else {
            return Err(StorageError::State("writer already stopped".into()));
        };
        self.writer.shutdown();
        join.join()
            .map_err(|_| StorageError::Hardware("writer thread panicked".into()))
    }
}

impl<D: Disk, B: BackupMemory> Drop for FlightStorage<D, B> {
    fn drop(&mut self) {
        if self.join.is_some() {
            if let Err(e) = self.stop() {
                warn!("Storage shutdown on drop failed: {}", e);
            }
        }
    }
}
