//! Checksummed board configuration

pub mod backup;
pub mod board;
pub mod store;

pub use backup::{BackupMemory, RamBackup};
pub use board::{weighted_checksum, BoardConfig, ConfigValue, FieldKind, CHECKSUM_SEED, RECORD_LEN};
pub use store::{ConfigSource, ConfigStore, CONFIG_PATH};
