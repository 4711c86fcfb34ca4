//! Read-through caching of directory listings, statistics and search
//! results.
//!
//! The filesystem is always the source of truth. Cached values are JSON
//! snapshots that expire on their own, and are thrown away early by
//! [`MetadataCache::invalidate()`] whenever a mutation could have changed them.
//!
//! The cache is strictly an optimization: when it misbehaves (unreachable
//! database, undecodable payload) the failure is logged and the freshly
//! computed value is served instead.

use crate::error::{ErrorKind, Result};
use burrow_cache::{StoreHandle, keys};
use burrow_config::Config;
use burrow_storage::{BackendHandle, FileEntry, FileStats, StoragePath};
use exn::ResultExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::iter;
use std::time::Duration;
use time::OffsetDateTime;

/// Time-to-live of each kind of cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttls {
    pub listing: Duration,
    pub stats: Duration,
    pub search: Duration,
    pub favorites: Duration,
    pub progress: Duration,
}
impl Default for Ttls {
    fn default() -> Self {
        Self {
            listing: keys::DEFAULT_LISTING_TTL,
            stats: keys::DEFAULT_STATS_TTL,
            search: keys::DEFAULT_SEARCH_TTL,
            favorites: keys::DEFAULT_FAVORITES_TTL,
            progress: keys::DEFAULT_PROGRESS_TTL,
        }
    }
}
impl From<&Config> for Ttls {
    fn from(config: &Config) -> Self {
        Self {
            listing: config.cache.listing_ttl,
            stats: config.cache.stats_ttl,
            search: config.cache.search_ttl,
            favorites: config.cache.favorites_ttl,
            progress: config.upload.progress_ttl,
        }
    }
}

#[derive(Clone)]
pub struct MetadataCache {
    backend: BackendHandle,
    store: StoreHandle,
    ttls: Ttls,
}
impl MetadataCache {
    pub fn new(backend: BackendHandle, store: StoreHandle, ttls: Ttls) -> Self {
        Self { backend, store, ttls }
    }

    pub fn ttls(&self) -> &Ttls {
        &self.ttls
    }

    pub(crate) fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Serve `key` from the cache, or compute, store and return it.
    ///
    /// Without a key the value is computed every time.
    pub(crate) async fn read_through<T, F, Fut>(&self, key: Option<&str>, ttl: Duration, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(key) = key {
            match self.store.get(key).await {
                Ok(Some(raw)) => match serde_json::from_str(&raw) {
                    Ok(value) => {
                        tracing::trace!(key, "Cache hit");
                        return Ok(value);
                    },
                    Err(e) => tracing::warn!(key, error = %e, "Discarding undecodable cache entry"),
                },
                Ok(None) => tracing::trace!(key, "Cache miss"),
                Err(e) => tracing::warn!(key, error = ?e, "Cache read failed; computing value"),
            }
        }
        let value = compute().await?;
        if let Some(key) = key {
            match serde_json::to_string(&value) {
                Ok(raw) => {
                    if let Err(e) = self.store.set(key, &raw, Some(ttl)).await {
                        tracing::warn!(key, error = ?e, "Failed to populate cache");
                    }
                },
                Err(e) => tracing::warn!(key, error = %e, "Failed to encode cache entry"),
            }
        }
        Ok(value)
    }

    /// Direct children of `dir`, sorted by name.
    pub async fn listing(&self, dir: &StoragePath) -> Result<Vec<FileEntry>> {
        let key = keys::listing(dir);
        self.read_through(Some(&key), self.ttls.listing, || async move {
            self.backend.list_dir(dir).await.map_err(ErrorKind::storage)
        })
        .await
    }

    /// Recursive totals beneath `path` (a file counts as itself).
    pub async fn stats(&self, path: &StoragePath) -> Result<FileStats> {
        let key = keys::stats(path);
        self.read_through(Some(&key), self.ttls.stats, || async move {
            self.backend.stats(path).await.map_err(ErrorKind::storage)
        })
        .await
    }

    /// Every entry whose name contains `keyword`, ignoring case.
    ///
    /// The keyword is recorded in the search history before results are
    /// served. Results are not invalidated by mutations; they live for the
    /// (short) search TTL.
    pub async fn search(&self, keyword: &str) -> Result<Vec<FileEntry>> {
        if keyword.trim().is_empty() {
            exn::bail!(ErrorKind::InvalidArgument("search keyword is empty".to_string()));
        }
        self.record_search(keyword).await;
        let key = keys::search(keyword);
        self.read_through(key.as_deref(), self.ttls.search, || async move {
            self.backend.search(keyword).await.map_err(ErrorKind::storage)
        })
        .await
    }

    async fn record_search(&self, keyword: &str) {
        // Millisecond precision is plenty for ordering, and stays exact in an f64.
        let score = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as f64;
        if let Err(e) = self.store.zadd(keys::SEARCH_HISTORY, keyword, score).await {
            tracing::warn!(keyword, error = ?e, "Failed to record search history");
            return;
        }
        if let Err(e) = self.store.ztrim(keys::SEARCH_HISTORY, keys::SEARCH_HISTORY_LIMIT).await {
            tracing::warn!(error = ?e, "Failed to prune search history");
        }
    }

    /// Most recent distinct search keywords, newest first.
    pub async fn search_history(&self) -> Result<Vec<String>> {
        self.store
            .zrevrange(keys::SEARCH_HISTORY, keys::SEARCH_HISTORY_LIMIT)
            .await
            .or_raise(|| ErrorKind::Cache)
    }

    /// Throw away every cached listing and statistic that `path` contributes
    /// to: its own, those of every ancestor up to the root, and those of
    /// everything beneath it.
    pub async fn invalidate(&self, path: &StoragePath) {
        for affected in iter::once(path.clone()).chain(path.ancestors()) {
            for key in [keys::listing(&affected), keys::stats(&affected)] {
                if let Err(e) = self.store.delete(&key).await {
                    tracing::warn!(key = %key, error = ?e, "Failed to invalidate cache entry");
                }
            }
        }
        for pattern in [keys::listing_descendants(path), keys::stats_descendants(path)] {
            match self.store.delete_matching(&pattern).await {
                Ok(0) => {},
                Ok(removed) => tracing::trace!(pattern = %pattern, removed, "Invalidated descendant cache entries"),
                Err(e) => tracing::warn!(pattern = %pattern, error = ?e, "Failed to invalidate descendant cache entries"),
            }
        }
        tracing::debug!(path = %path, "Invalidated cached metadata");
    }
}
