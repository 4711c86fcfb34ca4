//! The file service facade.

use crate::error::{ErrorKind, Result};
use crate::favorites::Favorites;
use crate::janitor::Janitor;
use crate::listing::{MetadataCache, Ttls};
use crate::mutate::{Download, Mutations};
use crate::upload::{UploadOutcome, UploadProgress, Uploads};
use async_trait::async_trait;
use burrow_cache::{Database, Favorite, FavoriteRepository, Location, SqliteStore, StoreHandle};
use burrow_config::Config;
use burrow_storage::backend::LocalBackend;
use burrow_storage::{BackendHandle, ChunkStore, FileEntry, FileStats, StoragePath};
use exn::ResultExt;
use std::sync::Arc;
use std::time::Duration;

/// Everything a client can ask of a file store.
///
/// [`Files`] is the implementation over a local directory tree; other
/// backends only need to provide the same capabilities.
#[async_trait]
pub trait FileService: Send + Sync {
    /// Direct children of `dir`, sorted by name.
    async fn list(&self, dir: &StoragePath) -> Result<Vec<FileEntry>>;
    async fn stats(&self, path: &StoragePath) -> Result<FileStats>;
    async fn search(&self, keyword: &str) -> Result<Vec<FileEntry>>;
    async fn search_history(&self) -> Result<Vec<String>>;

    async fn create_folder(&self, path: &StoragePath) -> Result<FileEntry>;
    async fn delete(&self, path: &StoragePath, force: bool) -> Result<()>;
    async fn rename(&self, path: &StoragePath, new_name: &str) -> Result<FileEntry>;
    async fn copy(&self, src: &StoragePath, dest: &StoragePath) -> Result<FileEntry>;
    async fn move_to(&self, src: &StoragePath, dest: &StoragePath) -> Result<FileEntry>;
    async fn download(&self, path: &StoragePath) -> Result<Download>;

    async fn upload_chunk(
        &self,
        dir: &StoragePath,
        name: &str,
        index: u32,
        total: u32,
        overwrite: bool,
        bytes: &[u8],
    ) -> Result<UploadOutcome>;
    async fn upload(&self, dir: &StoragePath, name: &str, overwrite: bool, bytes: &[u8]) -> Result<FileEntry>;
    async fn upload_progress(&self, dir: &StoragePath, name: &str) -> Result<Option<UploadProgress>>;
    async fn abort_upload(&self, dir: &StoragePath, name: &str) -> Result<()>;

    async fn add_favorite(&self, path: &StoragePath) -> Result<Favorite>;
    async fn remove_favorite(&self, path: &StoragePath) -> Result<bool>;
    async fn favorites(&self) -> Result<Vec<Favorite>>;
}

/// File service over a local directory tree.
#[derive(Clone)]
pub struct Files {
    store: StoreHandle,
    chunks: ChunkStore,
    cache: MetadataCache,
    mutations: Mutations,
    uploads: Uploads,
    favorites: Favorites,
    database: Option<Database>,
}
impl Files {
    pub fn new(
        backend: BackendHandle,
        store: StoreHandle,
        chunks: ChunkStore,
        repo: FavoriteRepository,
        ttls: Ttls,
    ) -> Self {
        let cache = MetadataCache::new(backend.clone(), store.clone(), ttls);
        Self {
            mutations: Mutations::new(backend.clone(), cache.clone()),
            uploads: Uploads::new(chunks.clone(), cache.clone()),
            favorites: Favorites::new(repo, backend, cache.clone()),
            store,
            chunks,
            cache,
            database: None,
        }
    }

    /// Open the store described by `config`, creating its directories and
    /// cache database as needed.
    pub async fn open(config: &Config) -> Result<Self> {
        let backend: BackendHandle =
            Arc::new(LocalBackend::new("local", &config.storage.upload_dir).map_err(ErrorKind::storage)?);
        let chunks = ChunkStore::new(&config.storage.temp_dir, backend.clone()).map_err(ErrorKind::storage)?;
        let location = match config.cache.in_memory() {
            true => Location::Memory,
            false => {
                if let Some(parent) = config.cache.database.parent() {
                    tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io)?;
                }
                Location::File(config.cache.database.clone())
            },
        };
        let database = Database::open(location).await.or_raise(|| ErrorKind::Cache)?;
        let store: StoreHandle = Arc::new(SqliteStore::from(&database));
        let repo = FavoriteRepository::from(&database);
        tracing::debug!(
            upload_dir = %config.storage.upload_dir.display(),
            temp_dir = %config.storage.temp_dir.display(),
            database = %config.cache.database.display(),
            "Opened file store"
        );
        Ok(Self { database: Some(database), ..Self::new(backend, store, chunks, repo, Ttls::from(config)) })
    }

    /// Close the cache database, if this instance opened it.
    pub async fn close(self) {
        if let Some(database) = self.database {
            database.close().await;
        }
    }

    /// Cleanup task for this store's abandoned uploads and expired cache rows.
    pub fn janitor(&self, stale_after: Duration, interval: Duration) -> Janitor {
        Janitor::new(self.chunks.clone(), self.store.clone(), stale_after, interval)
    }

    /// Like [`upload_chunk()`](FileService::upload_chunk), streaming the chunk
    /// from `reader`.
    pub async fn upload_chunk_from<R>(
        &self,
        dir: &StoragePath,
        name: &str,
        index: u32,
        total: u32,
        overwrite: bool,
        reader: R,
    ) -> Result<UploadOutcome>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        self.uploads.upload_chunk_from(dir, name, index, total, overwrite, reader).await
    }

    pub async fn check_write_permission(&self, dir: &StoragePath) -> Result<()> {
        self.mutations.check_write_permission(dir).await
    }
}

#[async_trait]
impl FileService for Files {
    async fn list(&self, dir: &StoragePath) -> Result<Vec<FileEntry>> {
        self.cache.listing(dir).await
    }

    async fn stats(&self, path: &StoragePath) -> Result<FileStats> {
        self.cache.stats(path).await
    }

    async fn search(&self, keyword: &str) -> Result<Vec<FileEntry>> {
        self.cache.search(keyword).await
    }

    async fn search_history(&self) -> Result<Vec<String>> {
        self.cache.search_history().await
    }

    async fn create_folder(&self, path: &StoragePath) -> Result<FileEntry> {
        self.mutations.create_folder(path).await
    }

    async fn delete(&self, path: &StoragePath, force: bool) -> Result<()> {
        self.mutations.delete(path, force).await
    }

    async fn rename(&self, path: &StoragePath, new_name: &str) -> Result<FileEntry> {
        self.mutations.rename(path, new_name).await
    }

    async fn copy(&self, src: &StoragePath, dest: &StoragePath) -> Result<FileEntry> {
        self.mutations.copy(src, dest).await
    }

    async fn move_to(&self, src: &StoragePath, dest: &StoragePath) -> Result<FileEntry> {
        self.mutations.move_to(src, dest).await
    }

    async fn download(&self, path: &StoragePath) -> Result<Download> {
        self.mutations.download(path).await
    }

    async fn upload_chunk(
        &self,
        dir: &StoragePath,
        name: &str,
        index: u32,
        total: u32,
        overwrite: bool,
        bytes: &[u8],
    ) -> Result<UploadOutcome> {
        self.uploads.upload_chunk(dir, name, index, total, overwrite, bytes).await
    }

    async fn upload(&self, dir: &StoragePath, name: &str, overwrite: bool, bytes: &[u8]) -> Result<FileEntry> {
        self.uploads.upload(dir, name, overwrite, bytes).await
    }

    async fn upload_progress(&self, dir: &StoragePath, name: &str) -> Result<Option<UploadProgress>> {
        self.uploads.progress(dir, name).await
    }

    async fn abort_upload(&self, dir: &StoragePath, name: &str) -> Result<()> {
        self.uploads.abort(dir, name).await
    }

    async fn add_favorite(&self, path: &StoragePath) -> Result<Favorite> {
        self.favorites.add(path).await
    }

    async fn remove_favorite(&self, path: &StoragePath) -> Result<bool> {
        self.favorites.remove(path).await
    }

    async fn favorites(&self) -> Result<Vec<Favorite>> {
        self.favorites.list().await
    }
}
