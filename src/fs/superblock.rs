use crate::error::{Result, StorageError};

pub const MAGIC: [u8; 8] = *b"FLTFS\x00\x01\x00";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;
pub const LABEL_LEN: usize = 16;

/// Encoded length without padding: fields plus trailing CRC-32.
const ENCODED_LEN: usize = 56;

/// Volume superblock (sector 0)
///
/// Sector 0 holds this record, followed by two metadata slots of
/// `meta_sectors` sectors each, followed by the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number: "FLTFS\x00\x01\x00"
    pub magic: [u8; 8],

    /// Format version (major)
    pub version_major: u16,

    /// Format version (minor)
    pub version_minor: u16,

    /// Sector size the volume was formatted with
    pub sector_size: u32,

    /// Sectors on the device at format time
    pub total_sectors: u64,

    /// Sectors per metadata slot
    pub meta_sectors: u32,

    /// First sector of the data region
    pub data_start: u64,

    /// Volume label, zero padded
    pub label: [u8; LABEL_LEN],
}

impl Superblock {
    pub fn new(sector_size: u32, total_sectors: u64, label: &str) -> Result<Self> {
        let meta_sectors = (total_sectors / 32).clamp(16, 1024) as u32;
        let data_start = 1 + 2 * meta_sectors as u64;
        if data_start + 16 > total_sectors {
            return Err(StorageError::Parameter(format!(
                "device of {} sectors too small for a volume",
                total_sectors
            )));
        }

        let mut label_bytes = [0u8; LABEL_LEN];
        let n = label.len().min(LABEL_LEN);
        label_bytes[..n].copy_from_slice(&label.as_bytes()[..n]);

        Ok(Superblock {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            sector_size,
            total_sectors,
            meta_sectors,
            data_start,
            label: label_bytes,
        })
    }

    /// Validate the magic and version
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(StorageError::NoFilesystem);
        }

        if self.version_major != VERSION_MAJOR {
            return Err(StorageError::Data(format!(
                "unsupported volume version {}.{}",
                self.version_major, self.version_minor
            )));
        }

        if self.data_start != 1 + 2 * self.meta_sectors as u64
            || self.data_start >= self.total_sectors
        {
            return Err(StorageError::NoFilesystem);
        }
        Ok(())
    }

    pub fn meta_slot_start(&self, slot: usize) -> u64 {
        1 + slot as u64 * self.meta_sectors as u64
    }

    pub fn data_sectors(&self) -> u64 {
        self.total_sectors - self.data_start
    }

    pub fn label(&self) -> String {
        let end = self.label.iter().position(|&b| b == 0).unwrap_or(LABEL_LEN);
        String::from_utf8_lossy(&self.label[..end]).into_owned()
    }

    /// Serialize to one sector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.sector_size as usize);
        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version_major.to_le_bytes());
        bytes.extend_from_slice(&self.version_minor.to_le_bytes());
        bytes.extend_from_slice(&self.sector_size.to_le_bytes());
        bytes.extend_from_slice(&self.total_sectors.to_le_bytes());
        bytes.extend_from_slice(&self.meta_sectors.to_le_bytes());
        bytes.extend_from_slice(&self.data_start.to_le_bytes());
        bytes.extend_from_slice(&self.label);
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());

        // Pad to sector size
        bytes.resize(self.sector_size as usize, 0);
        bytes
    }

    /// Deserialize from a sector; any mismatch reads as "no filesystem".
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENCODED_LEN {
            return Err(StorageError::NoFilesystem);
        }

        let body = &bytes[..ENCODED_LEN - 4];
        let stored = u32::from_le_bytes([
            bytes[ENCODED_LEN - 4],
            bytes[ENCODED_LEN - 3],
            bytes[ENCODED_LEN - 2],
            bytes[ENCODED_LEN - 1],
        ]);
        if crc32fast::hash(body) != stored {
            return Err(StorageError::NoFilesystem);
        }

        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u64_at = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(word)
        };

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        let mut label = [0u8; LABEL_LEN];
        label.copy_from_slice(&bytes[36..36 + LABEL_LEN]);

        let superblock = Superblock {
            magic,
            version_major: u16_at(8),
            version_minor: u16_at(10),
            sector_size: u32_at(12),
            total_sectors: u64_at(16),
            meta_sectors: u32_at(24),
            data_start: u64_at(28),
            label,
        };
        superblock.validate()?;
        Ok(superblock)
    }
}
