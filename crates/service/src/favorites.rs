//! Bookmarked paths.

use crate::error::{ErrorKind, Result};
use crate::listing::MetadataCache;
use burrow_cache::{Favorite, FavoriteRepository, keys};
use burrow_storage::{BackendHandle, StoragePath};
use exn::ResultExt;

#[derive(Clone)]
pub struct Favorites {
    repo: FavoriteRepository,
    backend: BackendHandle,
    cache: MetadataCache,
}
impl Favorites {
    pub fn new(repo: FavoriteRepository, backend: BackendHandle, cache: MetadataCache) -> Self {
        Self { repo, backend, cache }
    }

    async fn forget_list(&self) {
        if let Err(e) = self.cache.store().delete(keys::FAVORITES).await {
            tracing::warn!(error = ?e, "Failed to invalidate cached favorites");
        }
    }

    /// Bookmark an existing path. Bookmarking it again returns the original
    /// favorite.
    pub async fn add(&self, path: &StoragePath) -> Result<Favorite> {
        let entry = self.backend.stat(path).await.map_err(ErrorKind::storage)?;
        let name = path.file_name().unwrap_or("/");
        let favorite = self.repo.insert(name, path, entry.is_dir).await.or_raise(|| ErrorKind::Cache)?;
        self.forget_list().await;
        tracing::debug!(path = %path, id = favorite.id, "Added favorite");
        Ok(favorite)
    }

    /// Returns `true` if `path` was bookmarked. The target itself need not
    /// exist any more.
    pub async fn remove(&self, path: &StoragePath) -> Result<bool> {
        let removed = self.repo.remove(path).await.or_raise(|| ErrorKind::Cache)?;
        if removed {
            self.forget_list().await;
        }
        Ok(removed)
    }

    /// Every favorite, newest first.
    pub async fn list(&self) -> Result<Vec<Favorite>> {
        self.cache
            .read_through(Some(keys::FAVORITES), self.cache.ttls().favorites, || async move {
                self.repo.list().await.or_raise(|| ErrorKind::Cache)
            })
            .await
    }
}
