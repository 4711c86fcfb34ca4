//! Local filesystem storage backend.
//!
//! This module provides a storage backend implementation for the local filesystem.
//! Files are stored in a configured directory and accessed using standard filesystem
//! operations via `tokio::fs` for async I/O.

use crate::backend::{BoxSyncRead, EntryStream};
use crate::error::{ErrorKind, Result};
use crate::{FileEntry, StorageBackend, StoragePath, unique_suffix};
use async_stream::stream;
use async_trait::async_trait;
use std::fs::create_dir_all as sync_create_dir;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    File(FileEntry),
    Descend(FileEntry, PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// Stores files in a directory on the local filesystem. All paths are relative
/// to the configured root directory.
///
/// # Examples
///
/// ```no_run
/// use burrow_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/srv/burrow/upload")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory for the storage tree
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists and is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidArgument(format!("storage root must be absolute: {}", root.display())));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidArgument(format!("storage root is not a directory: {}", root.display())));
            }
        } else {
            // Use non-async here; it'll only happen once on startup and it's
            // not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| ErrorKind::from_io(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, path: &StoragePath) -> PathBuf {
        path.to_absolute(&self.root)
    }

    fn relative(&self, absolute: &Path) -> Result<StoragePath> {
        let Ok(relative) = absolute.strip_prefix(&self.root) else {
            exn::bail!(ErrorKind::InvalidArgument(format!("path is not within storage root: {}", absolute.display())));
        };
        StoragePath::parse(relative)
    }

    async fn process_entry(&self, entry: DirEntry) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| ErrorKind::from_io(e, &path))?;
        let relative = self.relative(&path)?;
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(FileEntry::from_metadata(relative, &metadata)?, path));
        }
        if metadata.is_file() {
            return Ok(WalkEntry::File(FileEntry::from_metadata(relative, &metadata)?));
        }
        // Note: silently drop symlinks and other special files. Following a
        // symlink could lead outside of the storage root.
        Ok(WalkEntry::Skip)
    }

    async fn ensure_parent(&self, path: &StoragePath) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(self.absolute(&parent)).await.map_err(|e| ErrorKind::from_io(e, &parent))?;
        }
        Ok(())
    }

    /// Copy a file or directory tree between two absolute locations.
    ///
    /// Iterative rather than recursive; async recursion needs boxing and the
    /// stack is just as readable.
    async fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
        let metadata = fs::metadata(from).await?;
        if !metadata.is_dir() {
            // `fs::copy` also copies the permission bits of the original file.
            fs::copy(from, to).await?;
            return Ok(());
        }
        let mut stack = vec![(from.to_path_buf(), to.to_path_buf())];
        while let Some((src, dest)) = stack.pop() {
            fs::create_dir(&dest).await?;
            fs::set_permissions(&dest, fs::metadata(&src).await?.permissions()).await?;
            let mut entries = fs::read_dir(&src).await?;
            while let Some(entry) = entries.next_entry().await? {
                let kind = entry.file_type().await?;
                let target = dest.join(entry.file_name());
                if kind.is_dir() {
                    stack.push((entry.path(), target));
                } else if kind.is_file() {
                    fs::copy(entry.path(), &target).await?;
                } else {
                    tracing::warn!(path = %entry.path().display(), "Skipping special file during copy");
                }
            }
        }
        Ok(())
    }

    async fn remove_any(path: &Path) -> std::io::Result<()> {
        match fs::metadata(path).await?.is_dir() {
            true => fs::remove_dir_all(path).await,
            false => fs::remove_file(path).await,
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_dir(&self, dir: &StoragePath) -> Result<Vec<FileEntry>> {
        let abs = self.absolute(dir);
        let metadata = fs::metadata(&abs).await.map_err(|e| ErrorKind::from_io(e, dir))?;
        if !metadata.is_dir() {
            exn::bail!(ErrorKind::InvalidArgument(format!("not a directory: {dir}")));
        }
        let mut entries = fs::read_dir(&abs).await.map_err(|e| ErrorKind::from_io(e, dir))?;
        let mut listing = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ErrorKind::from_io(e, dir))? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Removed between the directory read and the stat.
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => exn::bail!(ErrorKind::from_io(e, dir)),
            };
            if !metadata.is_dir() && !metadata.is_file() {
                continue;
            }
            listing.push(FileEntry::from_metadata(dir.child(&entry.file_name()), &metadata)?);
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    fn walk<'a>(&'a self, dir: &'a StoragePath) -> EntryStream<'a> {
        let mut stack = vec![self.absolute(dir)];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Asking for the contents of a directory that doesn't exist
                    // (or vanished mid-walk) results in nothing, not an error.
                    Err(err) if err.kind() == IoErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(ErrorKind::from_io(err, &current)));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(ErrorKind::from_io(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d, path)) => {
                            stack.push(path);
                            yield Ok(d);
                        },
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn stat(&self, path: &StoragePath) -> Result<FileEntry> {
        let metadata = fs::metadata(self.absolute(path)).await.map_err(|e| ErrorKind::from_io(e, path))?;
        FileEntry::from_metadata(path.clone(), &metadata)
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        Ok(fs::try_exists(self.absolute(path)).await.map_err(ErrorKind::Io)?)
    }

    async fn create_dir_all(&self, path: &StoragePath) -> Result<()> {
        Ok(fs::create_dir_all(self.absolute(path)).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn remove_file(&self, path: &StoragePath) -> Result<()> {
        Ok(fs::remove_file(self.absolute(path)).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn remove_dir(&self, path: &StoragePath) -> Result<()> {
        Ok(fs::remove_dir(self.absolute(path)).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn remove_dir_all(&self, path: &StoragePath) -> Result<()> {
        Ok(fs::remove_dir_all(self.absolute(path)).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn is_empty_dir(&self, path: &StoragePath) -> Result<bool> {
        let mut entries = fs::read_dir(self.absolute(path)).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(entries.next_entry().await.map_err(|e| ErrorKind::from_io(e, path))?.is_none())
    }

    async fn rename(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.ensure_parent(to).await?;
        let (src, dest) = (self.absolute(from), self.absolute(to));
        match fs::rename(&src, &dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::CrossesDevices => {
                tracing::debug!(from = %from, to = %to, "Rename crosses devices; copying instead");
                Self::copy_tree(&src, &dest).await.map_err(|e| ErrorKind::from_io(e, to))?;
                Ok(Self::remove_any(&src).await.map_err(|e| ErrorKind::from_io(e, from))?)
            },
            Err(e) => Err(ErrorKind::from_io(e, from).into()),
        }
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.ensure_parent(to).await?;
        Self::copy_tree(&self.absolute(from), &self.absolute(to)).await.map_err(|e| ErrorKind::from_io(e, from))?;
        Ok(())
    }

    async fn import_file(&self, local: &Path, to: &StoragePath) -> Result<()> {
        self.ensure_parent(to).await?;
        let dest = self.absolute(to);
        match fs::rename(local, &dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::CrossesDevices => {
                // Copy next to the destination first, so the final step is
                // still a single same-directory rename and the destination is
                // never observed half-written.
                let name = to.file_name().unwrap_or("import");
                let staging = dest.with_file_name(format!(".{name}.import-{}", unique_suffix()));
                if let Err(e) = fs::copy(local, &staging).await {
                    _ = fs::remove_file(&staging).await;
                    exn::bail!(ErrorKind::from_io(e, to));
                }
                if let Err(e) = fs::rename(&staging, &dest).await {
                    _ = fs::remove_file(&staging).await;
                    exn::bail!(ErrorKind::from_io(e, to));
                }
                _ = fs::remove_file(local).await;
                Ok(())
            },
            Err(e) => Err(ErrorKind::from_io(e, to).into()),
        }
    }

    async fn reader(&self, path: &StoragePath) -> Result<BoxSyncRead> {
        let abs = self.absolute(path);
        let metadata = fs::metadata(&abs).await.map_err(|e| ErrorKind::from_io(e, path))?;
        if metadata.is_dir() {
            exn::bail!(ErrorKind::InvalidArgument(format!("cannot read a directory: {path}")));
        }
        let file = fs::File::open(&abs).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(Box::new(file.into_std().await))
    }

    async fn check_write_permission(&self, dir: &StoragePath) -> Result<()> {
        let abs = self.absolute(dir);
        let probe = tokio::task::spawn_blocking(move || {
            // Named temporary files get a random name, so concurrent probes in
            // the same directory never collide.
            tempfile::Builder::new().prefix(".write-probe-").tempfile_in(&abs)?.close()
        })
        .await;
        match probe {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(dir = %dir, error = %e, "Write probe failed");
                exn::bail!(ErrorKind::PermissionDenied(dir.into()))
            },
            Err(e) => exn::bail!(ErrorKind::Io(std::io::Error::other(e))),
        }
    }
}
