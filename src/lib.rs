//! # flight-storage - Flight Recorder Storage Stack
//!
//! Persistent storage for a rocket flight computer. Telemetry from the sensor,
//! state-estimate and GPS producers is recorded onto raw NAND flash through a
//! stack of layers, each usable on its own:
//!
//! - **`nand`**: the chip contract and a simulated chip with fault injection
//! - **`ftl`**: logical pages over good blocks, wear leveling, GC, power-loss replay
//! - **`disk`**: sector block device shared with the host mass-storage path
//! - **`fs`**: directories and append-only byte-stream files with atomic commits
//! - **`flight`**: per-flight file sets and retention
//! - **`writer`**: the multi-stream recording task with pause/resume
//! - **`config`**: the checksummed board configuration
//! - **`service`**: wires all of the above together once at startup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flight_storage::{FlightStorage, NandDisk, RamBackup, SimNand, Geometry, StorageSettings};
//!
//! # fn main() -> flight_storage::Result<()> {
//! let disk = NandDisk::new(SimNand::new(Geometry::small(256)));
//! let storage = FlightStorage::start(disk, RamBackup::new(), &StorageSettings::default())?;
//!
//! let writer = storage.writer();
//! writer.enqueue_sensor(vec![0x08, 0x96, 0x01])?;
//! writer.log("armed");
//!
//! let stats = storage.shutdown()?;
//! println!("{} sensor frames recorded", stats.sensor_frames);
//! # Ok(())
//! # }
//! ```
//!
//! ## Using the layers directly
//!
//! ```rust,no_run
//! use flight_storage::{FileSystem, Geometry, NandDisk, SimNand};
//!
//! # fn main() -> flight_storage::Result<()> {
//! let disk = NandDisk::new(SimNand::new(Geometry::small(64)));
//! let mut fs = FileSystem::mount_or_format(disk, "BENCH")?;
//!
//! let fh = fs.create("/notes.txt")?;
//! fs.write(fh, b"static fire ok\n")?;
//! fs.close(fh)?;
//! assert_eq!(fs.read_to_end("/notes.txt")?, b"static fire ok\n");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod disk;
pub mod error;
pub mod flight;
pub mod fs;
pub mod ftl;
pub mod nand;
pub mod service;
pub mod settings;
pub mod writer;

pub use config::{BackupMemory, BoardConfig, ConfigSource, ConfigStore, ConfigValue, RamBackup};
pub use disk::{BoardDisk, Disk, DiskStatus, ImageDisk, Ioctl, NandDisk};
pub use error::{ErrorKind, Result, StorageError};
pub use flight::{FileManager, FlightKey, Layout, RotationScheme, SpaceReport, Stream};
pub use fs::{DirEntry, EntryKind, FileHandle, FileSystem, OpenMode};
pub use ftl::{Ftl, FtlStats};
pub use nand::{Geometry, NandDevice, SimNand};
pub use service::{ConfigHandle, FlightStorage};
pub use settings::{DiskKind, QueueSettings, StorageSettings};
pub use writer::{
    OverflowReport, PauseReason, StorageWriter, WriterHandle, WriterState, WriterStats,
};
