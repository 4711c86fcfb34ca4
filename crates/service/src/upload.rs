//! Chunked uploads.
//!
//! ```text
//!  ┌───────────┐ last chunk ┌─────────┐ ok   ┌────────┐
//!  │ Receiving ├───────────►│ Merging ├─────►│ Merged │
//!  └───────────┘            └────┬────┘      └────────┘
//!                                │ err       ┌─────────────┐
//!                                └──────────►│ MergeFailed │
//!                                            └─────────────┘
//! ```
//!
//! Progress is tracked in a cache hash per destination file. It is purely
//! informative: failing to record progress never fails an upload.

use crate::error::{ErrorKind, Result};
use crate::listing::MetadataCache;
use burrow_cache::keys;
use burrow_storage::{ChunkStore, FileEntry, StoragePath, UploadKey};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::AsyncRead;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UploadOutcome {
    /// More chunks are expected.
    Receiving { received: u32, total: u32 },
    /// The last chunk arrived and the file was assembled.
    Merged(FileEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadStatus {
    Uploading,
    Error,
}
impl UploadStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub status: UploadStatus,
    pub received: u32,
    pub total: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
impl UploadProgress {
    fn from_fields(fields: &BTreeMap<String, String>) -> Option<Self> {
        let status = match fields.get("status")?.as_str() {
            "uploading" => UploadStatus::Uploading,
            "error" => UploadStatus::Error,
            _ => return None,
        };
        let number = |name: &str| fields.get(name).and_then(|value| value.parse::<u32>().ok()).unwrap_or(0);
        Some(Self { status, received: number("received"), total: number("total"), error: fields.get("error").cloned() })
    }
}

#[derive(Clone)]
pub struct Uploads {
    chunks: ChunkStore,
    cache: MetadataCache,
}
impl Uploads {
    pub fn new(chunks: ChunkStore, cache: MetadataCache) -> Self {
        Self { chunks, cache }
    }

    fn key(dir: &StoragePath, name: &str) -> Result<UploadKey> {
        UploadKey::new(dir.clone(), name).map_err(ErrorKind::storage)
    }

    /// Receive one chunk; merges the file once chunk `total` arrives.
    pub async fn upload_chunk(
        &self,
        dir: &StoragePath,
        name: &str,
        index: u32,
        total: u32,
        overwrite: bool,
        bytes: &[u8],
    ) -> Result<UploadOutcome> {
        self.upload_chunk_from(dir, name, index, total, overwrite, bytes).await
    }

    /// Like [`upload_chunk()`](Self::upload_chunk), streaming the chunk from
    /// `reader`.
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
        R: AsyncRead + Unpin + Send,
    {
        let key = Self::key(dir, name)?;
        self.chunks.write_chunk_from(&key, index, total, reader).await.map_err(ErrorKind::storage)?;
        let received = self.chunks.received(&key).await.map_err(ErrorKind::storage)?;
        let received = u32::try_from(received.len()).unwrap_or(u32::MAX);
        self.record_chunk(&key, received, total).await;

        if !ChunkStore::is_last_chunk(index, total) {
            return Ok(UploadOutcome::Receiving { received, total });
        }

        match self.chunks.merge(&key, total, overwrite).await {
            Ok(entry) => {
                self.cache.invalidate(&entry.path).await;
                let progress = keys::upload_progress(&key.destination());
                if let Err(e) = self.cache.store().delete(&progress).await {
                    tracing::warn!(key = %progress, error = ?e, "Failed to clear upload progress");
                }
                Ok(UploadOutcome::Merged(entry))
            },
            Err(err) => {
                tracing::warn!(upload = %key.destination(), error = ?err, "Merge failed");
                self.record_failure(&key, &(*err).to_string()).await;
                Err(ErrorKind::storage(err))
            },
        }
    }

    /// Upload a whole file in one go (a single chunk of one).
    pub async fn upload(&self, dir: &StoragePath, name: &str, overwrite: bool, bytes: &[u8]) -> Result<FileEntry> {
        match self.upload_chunk(dir, name, 1, 1, overwrite, bytes).await? {
            UploadOutcome::Merged(entry) => Ok(entry),
            UploadOutcome::Receiving { .. } => exn::bail!(ErrorKind::ChunkMissing { index: 1, total: 1 }),
        }
    }

    /// `received` counts distinct chunks on disk, so re-sent chunks are not
    /// counted twice.
    async fn record_chunk(&self, key: &UploadKey, received: u32, total: u32) {
        let progress = keys::upload_progress(&key.destination());
        let store = self.cache.store();
        let recorded = async {
            store.hset(&progress, "status", UploadStatus::Uploading.as_str()).await?;
            store.hset(&progress, "total", &total.to_string()).await?;
            store.hset(&progress, "received", &received.to_string()).await?;
            // A retry after a failed merge starts afresh.
            store.hdel(&progress, "error").await?;
            store.expire(&progress, self.cache.ttls().progress).await
        }
        .await;
        if let Err(e) = recorded {
            tracing::warn!(key = %progress, error = ?e, "Failed to record upload progress");
        }
    }

    async fn record_failure(&self, key: &UploadKey, message: &str) {
        let progress = keys::upload_progress(&key.destination());
        let store = self.cache.store();
        let recorded = async {
            store.hset(&progress, "status", UploadStatus::Error.as_str()).await?;
            store.hset(&progress, "error", message).await?;
            store.expire(&progress, self.cache.ttls().progress).await
        }
        .await;
        if let Err(e) = recorded {
            tracing::warn!(key = %progress, error = ?e, "Failed to record upload failure");
        }
    }

    /// Last known progress of an upload, or `None` if nothing is recorded.
    pub async fn progress(&self, dir: &StoragePath, name: &str) -> Result<Option<UploadProgress>> {
        let key = Self::key(dir, name)?;
        let fields = self
            .cache
            .store()
            .hgetall(&keys::upload_progress(&key.destination()))
            .await
            .or_raise(|| ErrorKind::Cache)?;
        Ok(UploadProgress::from_fields(&fields))
    }

    /// Throw away everything received so far. Aborting an unknown upload is
    /// not an error.
    pub async fn abort(&self, dir: &StoragePath, name: &str) -> Result<()> {
        let key = Self::key(dir, name)?;
        self.chunks.abort(&key).await.map_err(ErrorKind::storage)?;
        let progress = keys::upload_progress(&key.destination());
        if let Err(e) = self.cache.store().delete(&progress).await {
            tracing::warn!(key = %progress, error = ?e, "Failed to clear upload progress");
        }
        tracing::info!(upload = %key.destination(), "Aborted upload");
        Ok(())
    }
}
