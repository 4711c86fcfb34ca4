//! Storage models.
//!
//! These types are produced from filesystem metadata on every call, and are
//! only ever cached as serialized collections (never persisted on their own).

use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use time::OffsetDateTime;

use crate::error::{ErrorKind, Result};
use crate::path::StoragePath;

/// One file or directory in the storage tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Final path component.
    pub name: String,
    /// Root-anchored path of the entry.
    pub path: StoragePath,
    /// Size in bytes, as reported by the filesystem.
    pub size: u64,
    /// Extension without the leading dot (empty when there is none).
    pub extension: String,
    pub is_dir: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
}
impl FileEntry {
    /// Re-use the same data collection from file metadata for both listing
    /// and stat operations.
    pub fn from_metadata(path: StoragePath, metadata: &Metadata) -> Result<Self> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?.into();
        let name = path.file_name().unwrap_or_default().to_string();
        let extension = match metadata.is_dir() {
            true => String::new(),
            false => path.as_path().extension().map(|ext| ext.to_string_lossy().into_owned()).unwrap_or_default(),
        };
        Ok(Self {
            name,
            path,
            size: metadata.len(),
            extension,
            is_dir: metadata.is_dir(),
            modified,
        })
    }
}

/// Aggregate counts over a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    pub total_files: u64,
    /// Folders beneath the walked directory, excluding the directory itself.
    pub total_folders: u64,
    pub total_size: u64,
}
impl FileStats {
    pub fn record(&mut self, entry: &FileEntry) {
        match entry.is_dir {
            true => self.total_folders += 1,
            false => {
                self.total_files += 1;
                self.total_size += entry.size;
            },
        }
    }
}
