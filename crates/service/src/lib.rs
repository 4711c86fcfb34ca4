//! Cache-coherent file management for burrow.
//!
//! The filesystem under the upload root is the source of truth. This crate
//! layers the behaviour clients see on top of it:
//! - [`MetadataCache`]: read-through caching of listings, statistics and
//!   search results, with invalidation of every ancestor on mutation.
//! - [`Mutations`]: create, delete, rename, copy and move.
//! - [`Uploads`]: chunked uploads with progress tracking.
//! - [`Favorites`]: bookmarked paths.
//! - [`Janitor`]: periodic cleanup of abandoned uploads and expired cache rows.
//!
//! [`Files`] wires them together behind the [`FileService`] trait.

pub mod error;
mod favorites;
mod janitor;
mod listing;
mod mutate;
mod service;
mod upload;

pub use crate::favorites::Favorites;
pub use crate::janitor::{Janitor, JanitorHandle, SweepReport};
pub use crate::listing::{MetadataCache, Ttls};
pub use crate::mutate::{Download, Mutations};
pub use crate::service::{FileService, Files};
pub use crate::upload::{UploadOutcome, UploadProgress, UploadStatus, Uploads};

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use burrow_cache::error::{ErrorKind as CacheErrorKind, Result as CacheResult};
    use burrow_cache::{CacheStore, Database, FavoriteRepository, SqliteStore, StoreHandle};
    use burrow_storage::backend::{BoxSyncRead, EntryStream, LocalBackend, StorageBackend};
    use burrow_storage::error::{ErrorKind as StorageErrorKind, Result as StorageResult};
    use burrow_storage::{BackendHandle, ChunkStore, FileEntry, StoragePath};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    pub fn p(path: &str) -> StoragePath {
        StoragePath::parse(path).unwrap()
    }

    /// A complete service over scratch directories and an in-memory cache.
    pub struct Fixture {
        pub upload: TempDir,
        _temp: TempDir,
        pub store: StoreHandle,
        pub backend: BackendHandle,
        pub chunks: ChunkStore,
        pub cache: MetadataCache,
        pub mutations: Mutations,
        pub uploads: Uploads,
        pub favorites: Favorites,
    }
    impl Fixture {
        pub async fn new() -> Self {
            Self::with_ttls(Ttls::default()).await
        }

        pub async fn with_ttls(ttls: Ttls) -> Self {
            let upload = TempDir::new().unwrap();
            let temp = TempDir::new().unwrap();
            let db = Database::connect_in_memory().await.unwrap();
            let store: StoreHandle = Arc::new(SqliteStore::from(&db));
            let backend: BackendHandle = Arc::new(LocalBackend::new("test", upload.path()).unwrap());
            let chunks = ChunkStore::new(temp.path(), backend.clone()).unwrap();
            let cache = MetadataCache::new(backend.clone(), store.clone(), ttls);
            Self {
                mutations: Mutations::new(backend.clone(), cache.clone()),
                uploads: Uploads::new(chunks.clone(), cache.clone()),
                favorites: Favorites::new(FavoriteRepository::from(&db), backend.clone(), cache.clone()),
                upload,
                _temp: temp,
                store,
                backend,
                chunks,
                cache,
            }
        }

        /// Write a file behind the service's back, creating parents.
        pub fn write(&self, path: &str, contents: &[u8]) {
            let path = self.upload.path().join(path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, contents).unwrap();
        }

        pub fn mkdir(&self, path: &str) {
            std::fs::create_dir_all(self.upload.path().join(path)).unwrap();
        }
    }

    /// A cache that is never available.
    pub struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _: &str) -> CacheResult<Option<String>> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> CacheResult<()> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn delete(&self, _: &str) -> CacheResult<bool> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn delete_matching(&self, _: &str) -> CacheResult<u64> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn expire(&self, _: &str, _: Duration) -> CacheResult<bool> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn hset(&self, _: &str, _: &str, _: &str) -> CacheResult<()> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn hincr(&self, _: &str, _: &str, _: i64) -> CacheResult<i64> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn hdel(&self, _: &str, _: &str) -> CacheResult<bool> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn hgetall(&self, _: &str) -> CacheResult<BTreeMap<String, String>> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn zadd(&self, _: &str, _: &str, _: f64) -> CacheResult<()> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn ztrim(&self, _: &str, _: usize) -> CacheResult<u64> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn zrevrange(&self, _: &str, _: usize) -> CacheResult<Vec<String>> {
            exn::bail!(CacheErrorKind::Database)
        }
        async fn purge_expired(&self) -> CacheResult<u64> {
            exn::bail!(CacheErrorKind::Database)
        }
    }

    /// Storage that can be read but refuses every write probe.
    pub struct ReadOnlyBackend(pub BackendHandle);

    #[async_trait]
    impl StorageBackend for ReadOnlyBackend {
        fn name(&self) -> &str {
            "read-only"
        }
        async fn list_dir(&self, dir: &StoragePath) -> StorageResult<Vec<FileEntry>> {
            self.0.list_dir(dir).await
        }
        fn walk<'a>(&'a self, dir: &'a StoragePath) -> EntryStream<'a> {
            self.0.walk(dir)
        }
        async fn stat(&self, path: &StoragePath) -> StorageResult<FileEntry> {
            self.0.stat(path).await
        }
        async fn exists(&self, path: &StoragePath) -> StorageResult<bool> {
            self.0.exists(path).await
        }
        async fn create_dir_all(&self, path: &StoragePath) -> StorageResult<()> {
            self.0.create_dir_all(path).await
        }
        async fn remove_file(&self, path: &StoragePath) -> StorageResult<()> {
            self.0.remove_file(path).await
        }
        async fn remove_dir(&self, path: &StoragePath) -> StorageResult<()> {
            self.0.remove_dir(path).await
        }
        async fn remove_dir_all(&self, path: &StoragePath) -> StorageResult<()> {
            self.0.remove_dir_all(path).await
        }
        async fn is_empty_dir(&self, path: &StoragePath) -> StorageResult<bool> {
            self.0.is_empty_dir(path).await
        }
        async fn rename(&self, from: &StoragePath, to: &StoragePath) -> StorageResult<()> {
            self.0.rename(from, to).await
        }
        async fn copy(&self, from: &StoragePath, to: &StoragePath) -> StorageResult<()> {
            self.0.copy(from, to).await
        }
        async fn import_file(&self, local: &Path, to: &StoragePath) -> StorageResult<()> {
            self.0.import_file(local, to).await
        }
        async fn reader(&self, path: &StoragePath) -> StorageResult<BoxSyncRead> {
            self.0.reader(path).await
        }
        async fn check_write_permission(&self, dir: &StoragePath) -> StorageResult<()> {
            exn::bail!(StorageErrorKind::PermissionDenied(dir.into()))
        }
    }
}
