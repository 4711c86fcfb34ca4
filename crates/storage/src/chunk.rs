//! Chunked upload staging.
//!
//! Every upload session gets its own namespace directory beneath the temp
//! root, named after a BLAKE3 hash of its destination. Chunks are numbered
//! from 1, and the last chunk has `index == total`.
//!
//! ```text
//! <temp_root>/
//!   9f86d081884c7d65.../
//!     1.chunk
//!     2.chunk
//!     3.2841-17.part      <- still being written
//! ```

use crate::error::{EntryKind, ErrorKind, Result};
use crate::path::validate_name;
use crate::{BackendHandle, FileEntry, StoragePath, unique_suffix};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const CHUNK_EXTENSION: &str = "chunk";

/// Identifies one upload session: the directory being uploaded into, and the
/// name of the file being uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadKey {
    dir: StoragePath,
    name: String,
}
impl UploadKey {
    pub fn new(dir: StoragePath, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { dir, name })
    }

    pub fn dir(&self) -> &StoragePath {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the merged file ends up.
    pub fn destination(&self) -> StoragePath {
        self.dir.child(OsStr::new(&self.name))
    }

    /// Name of the session's temporary namespace directory.
    ///
    /// The separator byte can never appear in either a path or a validated
    /// name, so no two distinct keys hash the same input.
    pub fn namespace(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.dir.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.name.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Whether a temp root entry is named like an upload namespace. Nothing else
/// in the temp root is ever swept.
fn is_namespace(name: &str) -> bool {
    name.len() == blake3::OUT_LEN * 2 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

type LockMap = Arc<StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Held for the duration of a merge. Removes its entry from the lock map when
/// the last interested party lets go.
struct SessionGuard {
    locks: LockMap,
    namespace: String,
    _guard: OwnedMutexGuard<()>,
}
impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        // One reference held by the map, one by our own guard. Anything more
        // is another merger already waiting in line.
        if locks.get(&self.namespace).is_some_and(|lock| Arc::strong_count(lock) <= 2) {
            locks.remove(&self.namespace);
        }
    }
}

/// Per-session temporary chunk storage, plus the merge step that turns a
/// complete set of chunks into a file inside a storage backend.
#[derive(Clone)]
pub struct ChunkStore {
    temp_root: PathBuf,
    backend: BackendHandle,
    locks: LockMap,
}
impl ChunkStore {
    /// # Errors
    ///
    /// Returns an error if the temp root is not absolute, or cannot be created.
    pub fn new(temp_root: impl AsRef<Path>, backend: BackendHandle) -> Result<Self> {
        let temp_root = temp_root.as_ref().to_path_buf();
        if !temp_root.is_absolute() {
            exn::bail!(ErrorKind::invalid(format!("temp root must be absolute: {}", temp_root.display())));
        }
        std::fs::create_dir_all(&temp_root).map_err(|e| ErrorKind::from_io(e, &temp_root))?;
        Ok(Self { temp_root, backend, locks: Arc::default() })
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    fn namespace_dir(&self, key: &UploadKey) -> PathBuf {
        self.temp_root.join(key.namespace())
    }

    fn chunk_path(namespace: &Path, index: u32) -> PathBuf {
        namespace.join(format!("{index}.{CHUNK_EXTENSION}"))
    }

    fn validate_index(index: u32, total: u32) -> Result<()> {
        if total == 0 {
            exn::bail!(ErrorKind::invalid("chunk total must be at least 1"));
        }
        if index == 0 || index > total {
            exn::bail!(ErrorKind::invalid(format!("chunk index {index} is outside 1..={total}")));
        }
        Ok(())
    }

    pub fn is_last_chunk(index: u32, total: u32) -> bool {
        index == total
    }

    /// Store one chunk from an in-memory buffer.
    pub async fn write_chunk(&self, key: &UploadKey, index: u32, total: u32, bytes: &[u8]) -> Result<()> {
        self.write_chunk_from(key, index, total, bytes).await
    }

    /// Store one chunk, streaming it from `reader`.
    ///
    /// The chunk is written to a uniquely named `.part` file and renamed into
    /// place, so a `<index>.chunk` file is only ever visible fully written.
    /// Two writers of the same index race; the last rename wins.
    pub async fn write_chunk_from<R>(&self, key: &UploadKey, index: u32, total: u32, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        Self::validate_index(index, total)?;
        let namespace = self.namespace_dir(key);
        fs::create_dir_all(&namespace).await.map_err(|e| ErrorKind::from_io(e, &namespace))?;
        let part = namespace.join(format!("{index}.{}.part", unique_suffix()));
        let written = async {
            let mut file = fs::File::create(&part).await?;
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&part, Self::chunk_path(&namespace, index)).await
        }
        .await;
        if let Err(e) = written {
            _ = fs::remove_file(&part).await;
            exn::bail!(ErrorKind::from_io(e, &part));
        }
        tracing::trace!(upload = %key.destination(), index, total, "Stored upload chunk");
        Ok(())
    }

    /// Indices of every chunk currently stored for the session, ascending.
    pub async fn received(&self, key: &UploadKey) -> Result<Vec<u32>> {
        let namespace = self.namespace_dir(key);
        let mut entries = match fs::read_dir(&namespace).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => exn::bail!(ErrorKind::from_io(e, &namespace)),
        };
        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ErrorKind::from_io(e, &namespace))? {
            let path = entry.path();
            if path.extension() != Some(OsStr::new(CHUNK_EXTENSION)) {
                continue;
            }
            if let Some(index) = path.file_stem().and_then(OsStr::to_str).and_then(|s| s.parse::<u32>().ok()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    async fn lock(&self, namespace: &str) -> SessionGuard {
        let lock = match self.locks.lock() {
            Ok(mut locks) => locks.entry(namespace.to_string()).or_default().clone(),
            // A poisoned map only means another merge panicked; the map itself
            // is still usable.
            Err(poisoned) => poisoned.into_inner().entry(namespace.to_string()).or_default().clone(),
        };
        SessionGuard { locks: self.locks.clone(), namespace: namespace.to_string(), _guard: lock.lock_owned().await }
    }

    /// Concatenate chunks `1..=total` into the session's destination file.
    ///
    /// Merges of the same session are serialized; whoever comes second finds
    /// the chunks gone and fails with [`ChunkMissing`](ErrorKind::ChunkMissing).
    /// On failure the chunks are left in place so the client can re-send the
    /// final part.
    #[tracing::instrument(level = "debug", skip(self), fields(upload = %key.destination()))]
    pub async fn merge(&self, key: &UploadKey, total: u32, overwrite: bool) -> Result<FileEntry> {
        if total == 0 {
            exn::bail!(ErrorKind::invalid("chunk total must be at least 1"));
        }
        let namespace_name = key.namespace();
        let _guard = self.lock(&namespace_name).await;
        let namespace = self.temp_root.join(&namespace_name);

        // Every chunk has to be present before a single byte gets written.
        for index in 1..=total {
            let exists = fs::try_exists(Self::chunk_path(&namespace, index))
                .await
                .map_err(|e| ErrorKind::from_io(e, &namespace))?;
            if !exists {
                exn::bail!(ErrorKind::ChunkMissing { index, total });
            }
        }

        let destination = key.destination();
        self.backend.create_dir_all(key.dir()).await?;
        self.backend.check_write_permission(key.dir()).await?;
        if self.backend.exists(&destination).await? {
            let occupant = self.backend.stat(&destination).await?;
            if occupant.is_dir || !overwrite {
                exn::bail!(ErrorKind::AlreadyExists {
                    path: (&destination).into(),
                    kind: EntryKind::from_is_dir(occupant.is_dir),
                });
            }
        }

        let staging = namespace.join(format!(".merge-{}", unique_suffix()));
        if let Err(e) = Self::concatenate(&namespace, &staging, total).await {
            _ = fs::remove_file(&staging).await;
            return Err(e);
        }
        if let Err(e) = self.backend.import_file(&staging, &destination).await {
            _ = fs::remove_file(&staging).await;
            return Err(e);
        }

        if let Err(e) = fs::remove_dir_all(&namespace).await {
            tracing::warn!(namespace = %namespace.display(), error = %e, "Failed to clean up upload namespace");
        }
        tracing::info!(path = %destination, chunks = total, backend = self.backend.name(), "Merged upload");
        self.backend.stat(&destination).await
    }

    async fn concatenate(namespace: &Path, staging: &Path, total: u32) -> Result<()> {
        let mut output = fs::File::create(staging).await.map_err(|e| ErrorKind::from_io(e, staging))?;
        for index in 1..=total {
            let path = Self::chunk_path(namespace, index);
            let mut chunk = match fs::File::open(&path).await {
                Ok(chunk) => chunk,
                Err(e) if e.kind() == IoErrorKind::NotFound => exn::bail!(ErrorKind::ChunkMissing { index, total }),
                Err(e) => exn::bail!(ErrorKind::from_io(e, &path)),
            };
            tokio::io::copy(&mut chunk, &mut output).await.map_err(|e| ErrorKind::from_io(e, staging))?;
        }
        output.flush().await.map_err(ErrorKind::Io)?;
        output.sync_all().await.map_err(ErrorKind::Io)?;
        Ok(())
    }

    /// Throw away everything received for a session. Aborting a session that
    /// doesn't exist is not an error.
    pub async fn abort(&self, key: &UploadKey) -> Result<()> {
        let namespace = self.namespace_dir(key);
        match fs::remove_dir_all(&namespace).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => exn::bail!(ErrorKind::from_io(e, &namespace)),
        }
    }

    /// Remove every namespace that has not been touched for `older_than`.
    ///
    /// Sessions that are currently merging are left alone. Returns how many
    /// namespaces were removed.
    pub async fn sweep_stale(&self, older_than: Duration) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.temp_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(0),
            Err(e) => exn::bail!(ErrorKind::from_io(e, &self.temp_root)),
        };
        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| ErrorKind::from_io(e, &self.temp_root))? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().filter(|name| is_namespace(name)) else {
                continue;
            };
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let idle = metadata.modified().ok().and_then(|modified| now.duration_since(modified).ok());
            if !idle.is_some_and(|idle| idle > older_than) {
                continue;
            }
            let merging = match self.locks.lock() {
                Ok(locks) => locks.contains_key(name),
                Err(poisoned) => poisoned.into_inner().contains_key(name),
            };
            if merging {
                continue;
            }
            match fs::remove_dir_all(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == IoErrorKind::NotFound => {},
                Err(e) => tracing::warn!(namespace = %path.display(), error = %e, "Failed to remove stale upload"),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Swept stale upload namespaces");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;

    struct Fixture {
        upload: tempfile::TempDir,
        temp: tempfile::TempDir,
        store: ChunkStore,
    }

    fn fixture() -> Fixture {
        let upload = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let backend: BackendHandle = Arc::new(LocalBackend::new("local", upload.path()).unwrap());
        let store = ChunkStore::new(temp.path(), backend).unwrap();
        Fixture { upload, temp, store }
    }

    fn key(dir: &str, name: &str) -> UploadKey {
        UploadKey::new(StoragePath::parse(dir).unwrap(), name).unwrap()
    }

    #[test]
    fn test_namespace_is_stable_and_distinct() {
        assert_eq!(key("a", "b").namespace(), key("/a/", "b").namespace());
        assert_ne!(key("a", "bc").namespace(), key("a/b", "c").namespace());
        assert_eq!(key("a/b", "c.txt").destination().to_string(), "/a/b/c.txt");
        assert!(UploadKey::new(StoragePath::root(), "../x").is_err());
    }

    #[test]
    fn test_is_last_chunk() {
        assert!(ChunkStore::is_last_chunk(3, 3));
        assert!(!ChunkStore::is_last_chunk(2, 3));
    }

    #[tokio::test]
    async fn test_merge_in_order() {
        let f = fixture();
        let key = key("a/b", "c.txt");
        // Arrival order doesn't matter, index order does.
        f.store.write_chunk(&key, 3, 3, b"CCC").await.unwrap();
        f.store.write_chunk(&key, 1, 3, b"AAA").await.unwrap();
        f.store.write_chunk(&key, 2, 3, b"BBB").await.unwrap();
        assert_eq!(f.store.received(&key).await.unwrap(), vec![1, 2, 3]);
        let entry = f.store.merge(&key, 3, false).await.unwrap();
        assert_eq!(entry.size, 9);
        assert_eq!(entry.path.to_string(), "/a/b/c.txt");
        assert_eq!(std::fs::read(f.upload.path().join("a/b/c.txt")).unwrap(), b"AAABBBCCC");
        // Namespace is cleaned up synchronously.
        assert!(!f.temp.path().join(key.namespace()).exists());
        assert!(f.store.received(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_chunk_writes_nothing() {
        let f = fixture();
        let key = key("", "big.bin");
        f.store.write_chunk(&key, 1, 3, b"AAA").await.unwrap();
        f.store.write_chunk(&key, 3, 3, b"CCC").await.unwrap();
        let err = f.store.merge(&key, 3, false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ChunkMissing { index: 2, total: 3 }));
        assert!(!f.upload.path().join("big.bin").exists());
        // Chunks survive so the client can retry.
        assert_eq!(f.store.received(&key).await.unwrap(), vec![1, 3]);
        f.store.write_chunk(&key, 2, 3, b"BBB").await.unwrap();
        f.store.merge(&key, 3, false).await.unwrap();
        assert_eq!(std::fs::read(f.upload.path().join("big.bin")).unwrap(), b"AAABBBCCC");
    }

    #[tokio::test]
    async fn test_chunk_index_bounds() {
        let f = fixture();
        let key = key("", "x");
        assert!(f.store.write_chunk(&key, 0, 3, b"").await.is_err());
        assert!(f.store.write_chunk(&key, 4, 3, b"").await.is_err());
        assert!(f.store.write_chunk(&key, 1, 0, b"").await.is_err());
        let err = f.store.merge(&key, 0, false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_merge_respects_existing_destination() {
        let f = fixture();
        std::fs::write(f.upload.path().join("taken.txt"), b"old").unwrap();
        std::fs::create_dir(f.upload.path().join("folder")).unwrap();

        let file_key = key("", "taken.txt");
        f.store.write_chunk(&file_key, 1, 1, b"new").await.unwrap();
        let err = f.store.merge(&file_key, 1, false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists { kind: EntryKind::File, .. }));
        assert_eq!(std::fs::read(f.upload.path().join("taken.txt")).unwrap(), b"old");
        f.store.merge(&file_key, 1, true).await.unwrap();
        assert_eq!(std::fs::read(f.upload.path().join("taken.txt")).unwrap(), b"new");

        let dir_key = key("", "folder");
        f.store.write_chunk(&dir_key, 1, 1, b"data").await.unwrap();
        let err = f.store.merge(&dir_key, 1, true).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists { kind: EntryKind::Directory, .. }));
    }

    #[tokio::test]
    async fn test_merge_happens_exactly_once() {
        let f = fixture();
        let key = key("", "once.txt");
        f.store.write_chunk(&key, 1, 2, b"12").await.unwrap();
        f.store.write_chunk(&key, 2, 2, b"34").await.unwrap();
        let (first, second) = tokio::join!(f.store.merge(&key, 2, true), f.store.merge(&key, 2, true));
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let failed = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(&**failed, ErrorKind::ChunkMissing { index: 1, total: 2 }));
        assert_eq!(std::fs::read(f.upload.path().join("once.txt")).unwrap(), b"1234");
        assert!(f.store.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let f = fixture();
        let key = key("", "gone.txt");
        f.store.write_chunk(&key, 1, 2, b"half").await.unwrap();
        f.store.abort(&key).await.unwrap();
        f.store.abort(&key).await.unwrap();
        assert!(f.store.received(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_stale() {
        let f = fixture();
        f.store.write_chunk(&key("", "one"), 1, 2, b"1").await.unwrap();
        f.store.write_chunk(&key("", "two"), 1, 2, b"2").await.unwrap();
        // Nothing is older than an hour.
        assert_eq!(f.store.sweep_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.store.sweep_stale(Duration::from_millis(1)).await.unwrap(), 2);
        assert_eq!(std::fs::read_dir(f.temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_only_touches_upload_namespaces() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("upload/docs")).unwrap();
        std::fs::write(root.path().join("upload/docs/precious.txt"), b"keep").unwrap();
        std::fs::create_dir_all(root.path().join("db")).unwrap();
        std::fs::create_dir_all(root.path().join("A".repeat(64))).unwrap();
        let backend: BackendHandle = Arc::new(LocalBackend::new("local", root.path().join("upload")).unwrap());
        let store = ChunkStore::new(root.path(), backend).unwrap();
        let key = key("", "stale.bin");
        store.write_chunk(&key, 1, 2, b"1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.sweep_stale(Duration::from_millis(1)).await.unwrap(), 1);
        assert!(!root.path().join(key.namespace()).exists());
        assert_eq!(std::fs::read(root.path().join("upload/docs/precious.txt")).unwrap(), b"keep");
        assert!(root.path().join("db").is_dir());
        assert!(root.path().join("A".repeat(64)).is_dir());
    }

    #[test]
    fn test_namespace_names() {
        assert!(is_namespace(&key("a", "b").namespace()));
        assert!(!is_namespace("upload"));
        assert!(!is_namespace(&"F".repeat(64)));
        assert!(!is_namespace(&"a".repeat(63)));
    }
}
