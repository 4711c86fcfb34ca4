//! Background cleanup of abandoned uploads and expired cache rows.

use crate::error::{ErrorKind, Result};
use burrow_cache::StoreHandle;
use burrow_storage::ChunkStore;
use exn::ResultExt;
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub stale_uploads: usize,
    pub expired_entries: u64,
}

#[derive(Clone)]
pub struct Janitor {
    chunks: ChunkStore,
    store: StoreHandle,
    stale_after: Duration,
    interval: Duration,
}
impl Janitor {
    pub fn new(chunks: ChunkStore, store: StoreHandle, stale_after: Duration, interval: Duration) -> Self {
        Self { chunks, store, stale_after, interval }
    }

    /// A single cleanup pass.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let stale_uploads = self.chunks.sweep_stale(self.stale_after).await.map_err(ErrorKind::storage)?;
        let expired_entries = self.store.purge_expired().await.or_raise(|| ErrorKind::Cache)?;
        Ok(SweepReport { stale_uploads, expired_entries })
    }

    /// Run a cleanup pass every interval until the returned handle is shut
    /// down. A failing pass is logged and retried on the next tick.
    pub fn spawn(self) -> JanitorHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => match self.run_once().await {
                        Ok(report) => tracing::debug!(
                            stale_uploads = report.stale_uploads,
                            expired_entries = report.expired_entries,
                            "Janitor pass finished"
                        ),
                        Err(e) => tracing::warn!(error = ?e, "Janitor pass failed"),
                    },
                }
            }
            tracing::debug!("Janitor stopped");
        });
        JanitorHandle { token, task }
    }
}

pub struct JanitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}
impl JanitorHandle {
    /// Stop the janitor, waiting for an in-flight pass to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Janitor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{Fixture, p};
    use burrow_storage::UploadKey;

    #[tokio::test]
    async fn test_run_once_sweeps_and_purges() {
        let f = Fixture::new().await;
        let key = UploadKey::new(p("a"), "old.bin").unwrap();
        f.chunks.write_chunk(&key, 1, 2, b"x").await.unwrap();
        f.store.set("short", "lived", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let janitor = Janitor::new(f.chunks.clone(), f.store.clone(), Duration::ZERO, Duration::from_secs(60));
        let report = janitor.run_once().await.unwrap();
        assert_eq!(report, SweepReport { stale_uploads: 1, expired_entries: 1 });
        assert_eq!(janitor.run_once().await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn test_fresh_uploads_are_kept() {
        let f = Fixture::new().await;
        let key = UploadKey::new(p("a"), "new.bin").unwrap();
        f.chunks.write_chunk(&key, 1, 2, b"x").await.unwrap();
        let janitor = Janitor::new(f.chunks.clone(), f.store.clone(), Duration::from_secs(3600), Duration::from_secs(60));
        assert_eq!(janitor.run_once().await.unwrap().stale_uploads, 0);
        assert_eq!(f.chunks.received(&key).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_spawned_janitor_runs_and_shuts_down() {
        let f = Fixture::new().await;
        let key = UploadKey::new(p("a"), "old.bin").unwrap();
        f.chunks.write_chunk(&key, 1, 2, b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handle = Janitor::new(f.chunks.clone(), f.store.clone(), Duration::from_millis(1), Duration::from_millis(10)).spawn();
        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;
        assert!(f.chunks.received(&key).await.unwrap().is_empty());
    }
}
