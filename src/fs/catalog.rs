//! Path → metadata catalog
//!
//! Paths are absolute, `/`-separated, with no empty, `.` or `..` components.
//! The root directory is implicit and never stored.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAX_NAME_LEN: usize = 64;

/// File type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// Run of consecutive data-region sectors
///
/// Serialized as a `[start, len]` pair to keep the catalog snapshot small.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, u32)", into = "(u64, u32)")]
pub struct Extent {
    pub start: u64,
    pub len: u32,
}

impl From<(u64, u32)> for Extent {
    fn from((start, len): (u64, u32)) -> Self {
        Extent { start, len }
    }
}

impl From<Extent> for (u64, u32) {
    fn from(extent: Extent) -> Self {
        (extent.start, extent.len)
    }
}

/// File metadata stored in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File type
    pub file_type: FileType,

    /// File size in bytes
    pub size: u64,

    /// Sectors holding the content, in file order
    pub extents: Vec<Extent>,

    /// Creation timestamp (Unix epoch seconds)
    pub created_at: u64,

    /// Last modified timestamp (Unix epoch seconds)
    pub modified_at: u64,
}

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl FileMetadata {
    pub fn new(file_type: FileType) -> Self {
        let now = now();
        FileMetadata {
            file_type,
            size: 0,
            extents: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn file() -> Self {
        Self::new(FileType::File)
    }

    pub fn directory() -> Self {
        Self::new(FileType::Directory)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn touch(&mut self) {
        self.modified_at = now();
    }

    pub fn sector_count(&self) -> u64 {
        self.extents.iter().map(|e| e.len as u64).sum()
    }

    /// Data-region sector holding the `index`-th sector of the file.
    pub fn sector_at(&self, index: u64) -> Option<u64> {
        let mut remaining = index;
        for extent in &self.extents {
            if remaining < extent.len as u64 {
                return Some(extent.start + remaining);
            }
            remaining -= extent.len as u64;
        }
        None
    }

    pub fn last_sector(&self) -> Option<u64> {
        self.extents
            .last()
            .map(|e| e.start + e.len as u64 - 1)
    }

    /// Append a sector, extending the last extent when contiguous.
    pub fn push_sector(&mut self, sector: u64) {
        if let Some(last) = self.extents.last_mut() {
            if last.start + last.len as u64 == sector {
                last.len += 1;
                return;
            }
        }
        self.extents.push(Extent {
            start: sector,
            len: 1,
        });
    }

    pub fn sectors(&self) -> Vec<u64> {
        self.extents
            .iter()
            .flat_map(|e| e.start..e.start + e.len as u64)
            .collect()
    }

    /// Drop all content, returning the sectors it occupied.
    pub fn truncate(&mut self) -> Vec<u64> {
        let sectors = self.sectors();
        self.extents.clear();
        self.size = 0;
        self.touch();
        sectors
    }
}

/// Validate and canonicalize an absolute path.
pub fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(StorageError::Parameter(format!("path must be absolute: {:?}", path)));
    }
    if path == "/" {
        return Ok(String::from("/"));
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    for component in trimmed[1..].split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(StorageError::Parameter(format!("invalid path: {:?}", path)));
        }
        if component.len() > MAX_NAME_LEN {
            return Err(StorageError::Parameter(format!(
                "name longer than {} bytes: {:?}",
                MAX_NAME_LEN, component
            )));
        }
    }
    Ok(trimmed.to_string())
}

/// Parent directory of a normalized path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Join a directory and an entry name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    entries: BTreeMap<String, FileMetadata>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileMetadata> {
        self.entries.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut FileMetadata> {
        self.entries.get_mut(path)
    }

    pub fn insert(&mut self, path: String, metadata: FileMetadata) {
        self.entries.insert(path, metadata);
    }

    pub fn remove(&mut self, path: &str) -> Option<FileMetadata> {
        self.entries.remove(path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        path == "/" || self.entries.get(path).is_some_and(|m| m.is_dir())
    }

    /// Direct children of a directory, in name order.
    pub fn children<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = (&'a str, &'a FileMetadata)> {
        let prefix = if dir == "/" {
            String::from("/")
        } else {
            format!("{}/", dir)
        };
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(path, _)| path.starts_with(&prefix))
            .filter(move |(path, _)| parent(path) == Some(dir))
            .map(|(path, meta)| (file_name(path), meta))
    }

    /// Move an entry and everything below it.
    pub fn rename(&mut self, from: &str, to: &str) {
        let prefix = format!("{}/", from);
        let moved: Vec<String> = self
            .entries
            .keys()
            .filter(|p| p.as_str() == from || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(meta) = self.entries.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                self.entries.insert(new, meta);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileMetadata)> {
        self.entries.iter()
    }

    /// Every data-region sector owned by a file.
    pub fn used_sectors(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries
            .values()
            .flat_map(|meta| meta.extents.iter())
            .flat_map(|e| e.start..e.start + e.len as u64)
    }
}
