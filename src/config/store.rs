use super::backup::BackupMemory;
use super::board::{BoardConfig, ConfigValue};
use crate::disk::Disk;
use crate::error::{Result, StorageError};
use crate::flight::FileManager;
use tracing::{debug, info, warn};

/// Default location of the flash copy
pub const CONFIG_PATH: &str = "/config/board.cfg";

/// Where the resident config came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Backup,
    Flash,
    Defaults,
}

/// Tiered config store: backup memory, then the flash copy, then defaults
///
/// Every successful load leaves a valid, checksummed copy in backup memory.
/// Checksum mismatches are never errors, they only select the next tier.
pub struct ConfigStore<B: BackupMemory> {
    backup: B,
    path: String,
    config: BoardConfig,
    source: Option<ConfigSource>,
}

impl<B: BackupMemory> ConfigStore<B> {
    pub fn new(backup: B, path: impl Into<String>) -> Self {
        ConfigStore {
            backup,
            path: path.into(),
            config: BoardConfig::default(),
            source: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// How the resident config was obtained; `None` until loaded or after
    /// an invalidate.
    pub fn source(&self) -> Option<ConfigSource> {
        self.source
    }

    pub fn load<D: Disk>(&mut self, files: &mut FileManager<D>) -> Result<ConfigSource> {
        if let Some(config) = valid_record(&self.backup.read()) {
            debug!("Config loaded from backup memory");
            return Ok(self.install(config, ConfigSource::Backup));
        }

        match files.read_file(&self.path) {
            Ok(bytes) => match valid_record(&bytes) {
                Some(config) => {
                    self.backup.write(&config.to_bytes());
                    info!("Config restored from {}", self.path);
                    return Ok(self.install(config, ConfigSource::Flash));
                }
                None => warn!("Config at {} failed its checksum", self.path),
            },
            Err(e) => warn!("No usable config at {}: {}", self.path, e),
        }

        let config = BoardConfig::default();
        self.backup.write(&config.to_bytes());
        if let Err(e) = files.write_file(&self.path, &config.to_bytes()) {
            warn!("Storing default config failed: {}", e);
        }
        info!("Config reset to defaults");
        Ok(self.install(config, ConfigSource::Defaults))
    }

    fn install(&mut self, config: BoardConfig, source: ConfigSource) -> ConfigSource {
        self.config = config;
        self.source = Some(source);
        source
    }

    pub fn current(&self) -> Result<&BoardConfig> {
        match self.source {
            Some(_) => Ok(&self.config),
            None => Err(StorageError::State("config not loaded".into())),
        }
    }

    /// Seal the resident config and persist it to flash.
    pub fn commit<D: Disk>(&mut self, files: &mut FileManager<D>) -> Result<()> {
        if self.source.is_none() {
            return Err(StorageError::State("config not loaded".into()));
        }
        self.config.seal();
        let bytes = self.config.to_bytes();
        self.backup.write(&bytes);
        files.write_file(&self.path, &bytes)?;
        self.source = Some(ConfigSource::Flash);
        debug!("Config committed, checksum {:08x}", self.config.checksum);
        Ok(())
    }

    /// Force the next load past backup memory.
    pub fn invalidate(&mut self) {
        let mut bytes = self.backup.read();
        if bytes.len() >= 4 {
            let n = bytes.len();
            for b in &mut bytes[n - 4..] {
                *b = !*b;
            }
            self.backup.write(&bytes);
        }
        self.source = None;
        info!("Config invalidated");
    }

    pub fn get_value(&self, key: &str) -> Result<ConfigValue> {
        self.current()?.get(key)
    }

    /// Validate, apply and commit one field.
    pub fn set_value<D: Disk>(
        &mut self,
        files: &mut FileManager<D>,
        key: &str,
        text: &str,
    ) -> Result<ConfigValue> {
        self.current()?;
        let mut updated = self.config;
        let value = updated.set(key, text)?;
        self.config = updated;
        self.commit(files)?;
        info!("Config {} = {}", key, value);
        Ok(value)
    }

    pub fn describe(&self) -> String {
        self.config.describe()
    }
}

fn valid_record(bytes: &[u8]) -> Option<BoardConfig> {
    BoardConfig::from_bytes(bytes)
        .ok()
        .filter(|config| config.is_valid())
}
