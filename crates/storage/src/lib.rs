//! Storage primitives for burrow.
//!
//! Everything that touches the live file tree or the upload staging area goes
//! through this crate: root-confined [`StoragePath`]s, the [`StorageBackend`]
//! trait (and its local filesystem implementation), and the [`ChunkStore`]
//! that assembles chunked uploads.

pub mod backend;
pub mod chunk;
pub mod error;
mod models;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::chunk::{ChunkStore, UploadKey};
pub use crate::models::{FileEntry, FileStats};
pub use crate::path::{StoragePath, validate_name};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;

/// Suffix for temporary file names that must not collide, within this
/// process or with any other process sharing the same directories.
pub(crate) fn unique_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::Relaxed))
}
