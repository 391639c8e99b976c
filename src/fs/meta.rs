//! Metadata slots
//!
//! The catalog is committed as one JSON snapshot into one of two slots,
//! alternating by generation. A slot is only trusted if its CRC matches, so a
//! commit torn by power loss leaves the previous generation in the other slot
//! intact. The allocator is rebuilt from the catalog on read.

use super::allocator::BitmapAllocator;
use super::catalog::Catalog;
use super::superblock::Superblock;
use crate::disk::Disk;
use crate::error::{Result, StorageError};

pub const SLOT_MAGIC: [u8; 8] = *b"FSMETA01";
pub const SLOT_HEADER_LEN: usize = 24;

#[derive(Debug, Clone)]
pub struct VolumeState {
    pub catalog: Catalog,
    pub allocator: BitmapAllocator,
}

pub fn slot_for(generation: u64) -> usize {
    (generation % 2) as usize
}

/// Encode a slot image padded to whole sectors.
pub fn encode_slot(generation: u64, payload: &[u8], sector_size: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SLOT_HEADER_LEN + payload.len());
    bytes.extend_from_slice(&SLOT_MAGIC);
    bytes.extend_from_slice(&generation.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    bytes.extend_from_slice(payload);
    let padded = bytes.len().div_ceil(sector_size) * sector_size;
    bytes.resize(padded, 0);
    bytes
}

/// Parse a slot header: `(generation, payload_len, crc)`.
pub fn decode_slot_header(bytes: &[u8]) -> Option<(u64, usize, u32)> {
    if bytes.len() < SLOT_HEADER_LEN || bytes[0..8] != SLOT_MAGIC {
        return None;
    }
    let mut generation = [0u8; 8];
    generation.copy_from_slice(&bytes[8..16]);
    let len = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]) as usize;
    let crc = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    Some((u64::from_le_bytes(generation), len, crc))
}

pub fn write_slot<D: Disk>(
    disk: &D,
    superblock: &Superblock,
    generation: u64,
    catalog: &Catalog,
) -> Result<()> {
    let payload = serde_json::to_vec(catalog)?;
    let sector_size = superblock.sector_size as usize;
    let image = encode_slot(generation, &payload, sector_size);
    let sectors = image.len() / sector_size;
    if sectors > superblock.meta_sectors as usize {
        return Err(StorageError::Data(format!(
            "metadata of {} bytes exceeds slot of {} sectors",
            payload.len(),
            superblock.meta_sectors
        )));
    }
    disk.write_sectors(
        superblock.meta_slot_start(slot_for(generation)),
        sectors,
        &image,
    )
}

/// Read one slot. Corrupt or blank slots are `None`; device errors propagate.
pub fn read_slot<D: Disk>(
    disk: &D,
    superblock: &Superblock,
    slot: usize,
) -> Result<Option<(u64, VolumeState)>> {
    let sector_size = superblock.sector_size as usize;
    let start = superblock.meta_slot_start(slot);

    let mut first = vec![0u8; sector_size];
    disk.read_sectors(start, 1, &mut first)?;
    let Some((generation, len, crc)) = decode_slot_header(&first) else {
        return Ok(None);
    };

    let sectors = (SLOT_HEADER_LEN + len).div_ceil(sector_size);
    if sectors > superblock.meta_sectors as usize {
        return Ok(None);
    }
    let mut image = vec![0u8; sectors * sector_size];
    disk.read_sectors(start, sectors, &mut image)?;

    let payload = &image[SLOT_HEADER_LEN..SLOT_HEADER_LEN + len];
    if crc32fast::hash(payload) != crc {
        tracing::warn!("Metadata slot {} (generation {}) failed CRC", slot, generation);
        return Ok(None);
    }
    let catalog = match serde_json::from_slice::<Catalog>(payload) {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::warn!("Metadata slot {} unreadable: {}", slot, e);
            return Ok(None);
        }
    };
    match BitmapAllocator::from_used(superblock.data_sectors(), catalog.used_sectors()) {
        Ok(allocator) => Ok(Some((generation, VolumeState { catalog, allocator }))),
        Err(e) => {
            tracing::warn!("Metadata slot {} inconsistent: {}", slot, e);
            Ok(None)
        }
    }
}
