//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, which provides a unified
//! interface for the filesystem primitives the rest of the workspace builds
//! on. Policy (existence checks, force flags, cache invalidation) lives with
//! the callers; backends only do what they are told, and map failures onto
//! [`ErrorKind`](crate::error::ErrorKind).

mod local;

pub use self::local::LocalBackend;
use crate::error::{ErrorKind, Result};
use crate::models::{FileEntry, FileStats};
use crate::path::StoragePath;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt, future};
use std::io::Read;
use std::path::Path;
use std::pin::Pin;

pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = Result<FileEntry>> + Send + 'a>>;
pub type BoxSyncRead = Box<dyn Read + Send + 'static>;

/// Unified interface for storage backends.
///
/// All operations are asynchronous; each one is a blocking point for the
/// calling task and nothing else. Every path is a [`StoragePath`], so
/// implementations never see anything that could escape their root.
///
/// # Examples
///
/// ```
/// use burrow_storage::{StoragePath, backend::StorageBackend, error::Result};
///
/// async fn size_of(backend: &dyn StorageBackend, path: &str) -> Result<u64> {
///     let path = StoragePath::parse(path)?;
///     if backend.exists(&path).await? {
///         Ok(backend.stat(&path).await?.size)
///     } else {
///         Ok(0)
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend (used for logging only).
    fn name(&self) -> &str;

    /// Direct children of a directory, sorted by name.
    ///
    /// Returns [`NotFound`](ErrorKind::NotFound) if the directory does not
    /// exist and [`InvalidArgument`](ErrorKind::InvalidArgument) if it is not
    /// a directory.
    async fn list_dir(&self, dir: &StoragePath) -> Result<Vec<FileEntry>>;

    /// Stream every descendant of `dir` (files and directories, not `dir`
    /// itself), yielding results incrementally.
    ///
    /// A directory that doesn't exist yields an empty stream.
    fn walk<'a>(&'a self, dir: &'a StoragePath) -> EntryStream<'a>;

    /// Metadata for a single entry.
    ///
    /// Returns [`NotFound`](ErrorKind::NotFound) if the path does not exist.
    async fn stat(&self, path: &StoragePath) -> Result<FileEntry>;

    async fn exists(&self, path: &StoragePath) -> Result<bool>;

    /// Create a directory and every missing ancestor.
    async fn create_dir_all(&self, path: &StoragePath) -> Result<()>;

    async fn remove_file(&self, path: &StoragePath) -> Result<()>;

    /// Remove an empty directory.
    ///
    /// Returns [`DirectoryNotEmpty`](ErrorKind::DirectoryNotEmpty) if it has
    /// any entries.
    async fn remove_dir(&self, path: &StoragePath) -> Result<()>;

    /// Remove a directory and everything beneath it.
    async fn remove_dir_all(&self, path: &StoragePath) -> Result<()>;

    /// `true` if the directory has no entries.
    async fn is_empty_dir(&self, path: &StoragePath) -> Result<bool>;

    /// Rename/move an entry.
    ///
    /// # Notes
    /// - Implementations should create missing parent directories of `to`.
    /// - Callers are responsible for checking that `to` is free.
    /// - Implementations that cannot rename atomically (for example, across
    ///   devices) fall back to copy-then-delete.
    async fn rename(&self, from: &StoragePath, to: &StoragePath) -> Result<()>;

    /// Copy a file, or a directory tree, preserving permission bits.
    ///
    /// Callers are responsible for checking that `to` is free.
    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()>;

    /// Move a fully written local file (for example a merged upload) into
    /// storage at `to`, replacing any existing file there.
    async fn import_file(&self, local: &Path, to: &StoragePath) -> Result<()>;

    /// Open a file for streaming reads.
    ///
    /// Returns a `'static` boxed [`Read`] suitable for use inside
    /// [`spawn_blocking`](tokio::task::spawn_blocking).
    async fn reader(&self, path: &StoragePath) -> Result<BoxSyncRead>;

    /// Probe whether `dir` accepts writes by creating and removing a
    /// sentinel file.
    ///
    /// Returns [`PermissionDenied`](ErrorKind::PermissionDenied) on any
    /// failure, so a write-dependent operation can be refused before it
    /// starts.
    async fn check_write_permission(&self, dir: &StoragePath) -> Result<()>;

    /// Aggregate file/folder counts and total size beneath `path`.
    ///
    /// Default implementation folds over [`walk()`](Self::walk). A file
    /// counts as itself.
    async fn stats(&self, path: &StoragePath) -> Result<FileStats> {
        let top = self.stat(path).await?;
        if !top.is_dir {
            let mut stats = FileStats::default();
            stats.record(&top);
            return Ok(stats);
        }
        self.walk(path)
            .try_fold(FileStats::default(), |mut stats, entry| {
                stats.record(&entry);
                future::ready(Ok(stats))
            })
            .await
    }

    /// Case-insensitive substring match of `keyword` against the name of every
    /// entry in storage. Results are sorted by path.
    async fn search(&self, keyword: &str) -> Result<Vec<FileEntry>> {
        if keyword.trim().is_empty() {
            exn::bail!(ErrorKind::InvalidArgument("search keyword is empty".to_string()));
        }
        let needle = keyword.to_lowercase();
        let root = StoragePath::root();
        let mut found: Vec<FileEntry> = self
            .walk(&root)
            .try_filter(|entry| future::ready(entry.name.to_lowercase().contains(&needle)))
            .try_collect()
            .await?;
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }
}
