//! Deployment settings
//!
//! Loaded from TOML; every key is optional.
//!
//! ```toml
//! retain_flights = 8
//! rotation = "suffix"          # or "date_sequence"
//! layout = "flat"              # or "per_stream"
//! data_dir = "/data"
//! disk = "nand"                # or "image"
//!
//! [queues]
//! sensor = 64
//! state = 64
//! gps = 16
//! ```

use crate::error::{Result, StorageError};
use crate::flight::{Layout, RotationScheme};
use crate::writer::log_ring::LOG_RING_BYTES;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Board storage variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    /// Raw NAND behind the translation layer
    #[default]
    Nand,
    /// Sector image without translation (SD card boards)
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub sensor: usize,
    pub state: usize,
    pub gps: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            sensor: 64,
            state: 64,
            gps: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Flights kept on disk, the one being recorded included
    pub retain_flights: u32,
    pub rotation: RotationScheme,
    pub layout: Layout,
    pub data_dir: String,
    pub disk: DiskKind,
    pub queues: QueueSettings,
    /// Largest telemetry frame producers may enqueue
    pub max_frame_len: usize,
    pub log_ring_bytes: usize,
    pub config_path: String,
    pub volume_label: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            retain_flights: 8,
            rotation: RotationScheme::Suffix,
            layout: Layout::Flat,
            data_dir: String::from("/data"),
            disk: DiskKind::Nand,
            queues: QueueSettings::default(),
            max_frame_len: 256,
            log_ring_bytes: LOG_RING_BYTES,
            config_path: String::from(crate::config::CONFIG_PATH),
            volume_label: String::from("FLIGHT"),
        }
    }
}

impl StorageSettings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: StorageSettings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=99).contains(&self.retain_flights) {
            return Err(StorageError::Parameter(format!(
                "retain_flights must be 1..=99, got {}",
                self.retain_flights
            )));
        }
        for (name, len) in [
            ("sensor", self.queues.sensor),
            ("state", self.queues.state),
            ("gps", self.queues.gps),
        ] {
            if len == 0 {
                return Err(StorageError::Parameter(format!("{} queue length is zero", name)));
            }
        }
        if self.max_frame_len == 0 || self.log_ring_bytes == 0 {
            return Err(StorageError::Parameter(
                "max_frame_len and log_ring_bytes must be non-zero".into(),
            ));
        }
        if !self.data_dir.starts_with('/') || !self.config_path.starts_with('/') {
            return Err(StorageError::Parameter(
                "data_dir and config_path must be absolute".into(),
            ));
        }
        Ok(())
    }
}
