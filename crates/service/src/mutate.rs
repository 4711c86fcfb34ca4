//! Filesystem mutations.
//!
//! Every operation checks its preconditions against the filesystem, performs
//! the change through the storage backend, and then invalidates every cached
//! view of the paths it touched.

use crate::error::{ErrorKind, Result};
use crate::listing::MetadataCache;
use burrow_storage::backend::BoxSyncRead;
use burrow_storage::error::EntryKind;
use burrow_storage::{BackendHandle, FileEntry, StoragePath, validate_name};

/// An open file, ready to be streamed to a client.
pub struct Download {
    pub entry: FileEntry,
    /// Blocking reader; use inside [`spawn_blocking`](tokio::task::spawn_blocking).
    pub reader: BoxSyncRead,
}
impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download").field("entry", &self.entry).finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Mutations {
    backend: BackendHandle,
    cache: MetadataCache,
}
impl Mutations {
    pub fn new(backend: BackendHandle, cache: MetadataCache) -> Self {
        Self { backend, cache }
    }

    fn reject_root(path: &StoragePath, operation: &str) -> Result<()> {
        if path.is_root() {
            exn::bail!(ErrorKind::InvalidArgument(format!("cannot {operation} the storage root")));
        }
        Ok(())
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        self.backend.exists(path).await.map_err(ErrorKind::storage)
    }

    async fn stat(&self, path: &StoragePath) -> Result<FileEntry> {
        self.backend.stat(path).await.map_err(ErrorKind::storage)
    }

    /// Fails with [`AlreadyExists`](ErrorKind::AlreadyExists) if anything
    /// occupies `path`.
    async fn ensure_free(&self, path: &StoragePath) -> Result<()> {
        if self.exists(path).await? {
            let occupant = self.stat(path).await?;
            exn::bail!(ErrorKind::AlreadyExists { path: path.into(), kind: EntryKind::from_is_dir(occupant.is_dir) });
        }
        Ok(())
    }

    /// Fails with [`NotFound`](ErrorKind::NotFound) unless something occupies
    /// `path`.
    async fn ensure_present(&self, path: &StoragePath) -> Result<FileEntry> {
        self.stat(path).await
    }

    /// Create a directory, and any missing ancestors.
    pub async fn create_folder(&self, path: &StoragePath) -> Result<FileEntry> {
        Self::reject_root(path, "create")?;
        self.ensure_free(path).await?;
        self.backend.create_dir_all(path).await.map_err(ErrorKind::storage)?;
        self.cache.invalidate(path).await;
        tracing::info!(path = %path, "Created folder");
        self.stat(path).await
    }

    /// Delete a file or directory. Deleting something that doesn't exist
    /// succeeds; a non-empty directory is only deleted when forced.
    pub async fn delete(&self, path: &StoragePath, force: bool) -> Result<()> {
        Self::reject_root(path, "delete")?;
        if !self.exists(path).await? {
            tracing::debug!(path = %path, "Nothing to delete");
            return Ok(());
        }
        let target = self.stat(path).await?;
        let removed = match (target.is_dir, force) {
            (false, _) => self.backend.remove_file(path).await,
            (true, true) => self.backend.remove_dir_all(path).await,
            (true, false) => {
                if !self.backend.is_empty_dir(path).await.map_err(ErrorKind::storage)? {
                    exn::bail!(ErrorKind::DirectoryNotEmpty(path.into()));
                }
                self.backend.remove_dir(path).await
            },
        };
        removed.map_err(ErrorKind::storage)?;
        self.cache.invalidate(path).await;
        tracing::info!(path = %path, force, "Deleted");
        Ok(())
    }

    /// Rename within the same parent directory.
    pub async fn rename(&self, path: &StoragePath, new_name: &str) -> Result<FileEntry> {
        validate_name(new_name).map_err(ErrorKind::storage)?;
        Self::reject_root(path, "rename")?;
        self.ensure_present(path).await?;
        let parent = path.parent().unwrap_or_default();
        let target = parent.join(new_name).map_err(ErrorKind::storage)?;
        if &target == path {
            return self.stat(path).await;
        }
        self.ensure_free(&target).await?;
        self.backend.rename(path, &target).await.map_err(ErrorKind::storage)?;
        self.cache.invalidate(path).await;
        self.cache.invalidate(&target).await;
        tracing::info!(from = %path, to = %target, "Renamed");
        self.stat(&target).await
    }

    /// Copy a file (content and mode) or a directory tree.
    pub async fn copy(&self, src: &StoragePath, dest: &StoragePath) -> Result<FileEntry> {
        let source = self.ensure_present(src).await?;
        self.ensure_free(dest).await?;
        if source.is_dir && src.contains(dest) {
            exn::bail!(ErrorKind::InvalidArgument(format!("cannot copy {src} into itself")));
        }
        self.backend.copy(src, dest).await.map_err(ErrorKind::storage)?;
        self.cache.invalidate(dest).await;
        tracing::info!(from = %src, to = %dest, "Copied");
        self.stat(dest).await
    }

    /// Move anywhere in the tree; missing parents of `dest` are created.
    pub async fn move_to(&self, src: &StoragePath, dest: &StoragePath) -> Result<FileEntry> {
        Self::reject_root(src, "move")?;
        self.ensure_present(src).await?;
        self.ensure_free(dest).await?;
        if src.contains(dest) {
            exn::bail!(ErrorKind::InvalidArgument(format!("cannot move {src} into itself")));
        }
        self.backend.rename(src, dest).await.map_err(ErrorKind::storage)?;
        self.cache.invalidate(src).await;
        self.cache.invalidate(dest).await;
        tracing::info!(from = %src, to = %dest, "Moved");
        self.stat(dest).await
    }

    /// Fails with [`PermissionDenied`](ErrorKind::PermissionDenied) if `dir`
    /// does not accept new files.
    pub async fn check_write_permission(&self, dir: &StoragePath) -> Result<()> {
        self.backend.check_write_permission(dir).await.map_err(ErrorKind::storage)
    }

    pub async fn download(&self, path: &StoragePath) -> Result<Download> {
        let entry = self.ensure_present(path).await?;
        if entry.is_dir {
            exn::bail!(ErrorKind::InvalidArgument(format!("cannot download a directory: {path}")));
        }
        let reader = self.backend.reader(path).await.map_err(ErrorKind::storage)?;
        Ok(Download { entry, reader })
    }
}
