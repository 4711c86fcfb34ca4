//! Cache database connection.

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Where the cache database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Gone once the last connection closes.
    Memory,
    File(PathBuf),
}
impl Location {
    fn options(&self) -> SqliteConnectOptions {
        let options = SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            // Hash fields and sorted-set members cascade with their entry.
            .foreign_keys(true)
            // Losing the last few cache writes on power loss is harmless.
            .synchronous(SqliteSynchronous::Normal)
            // Every chunk of every upload writes a progress update, and WAL
            // mode still only allows one writer at a time.
            .busy_timeout(Duration::from_millis(1500));
        match self {
            Self::Memory => options.filename(":memory:"),
            Self::File(path) => options.filename(path).create_if_missing(true),
        }
    }

    fn pool_options(&self) -> SqlitePoolOptions {
        match self {
            // Every connection to ":memory:" opens its own, empty database, so
            // the single connection must never be reaped or recycled.
            Self::Memory => SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
            Self::File(_) => SqlitePoolOptions::new().max_connections(4),
        }
    }
}

/// Connection pool for the cache database.
///
/// Both the [`SqliteStore`](crate::SqliteStore) and the
/// [`FavoriteRepository`](crate::FavoriteRepository) are built from it.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    location: Location,
}

impl Database {
    /// Open (creating if needed) the database and bring its schema up to
    /// date. The parent directory of a file database must already exist.
    pub async fn open(location: Location) -> Result<Self> {
        let pool = location
            .pool_options()
            // Query-based PRAGMAs only affect the connection they run on.
            .after_connect(|conn, meta| Box::pin(async move { Self::tune(conn, meta).await }))
            .connect_with(location.options())
            .await
            .or_raise(|| ErrorKind::Database)?;
        let db = Self { pool, location };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(Location::File(path.as_ref().to_path_buf())).await
    }

    /// Not limited to `#[cfg(test)]`: other crates test against it too.
    pub async fn connect_in_memory() -> Result<Self> {
        Self::open(Location::Memory).await
    }

    async fn tune(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA temp_store = MEMORY;
                PRAGMA cache_size = -4096;
                PRAGMA wal_autocheckpoint = 1000;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    #[instrument("migrating cache database", skip(self), fields(location = ?self.location))]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Flush the write-ahead log into the database file and close every
    /// connection. Cache entries are only ever lost, never corrupted, so
    /// failures here are ignored.
    pub async fn close(&self) {
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        if let Location::File(path) = &self.location {
            if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&self.pool).await {
                tracing::debug!(path = %path.display(), error = %e, "WAL checkpoint failed");
            }
        }
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory() {
        let db = Database::connect_in_memory().await.unwrap();
        assert_eq!(db.location(), &Location::Memory);
        assert!(!db.pool().is_closed());
        db.close().await;
        assert!(db.pool().is_closed());
    }

    #[tokio::test]
    async fn test_file_database_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.sqlite3");
        let db = Database::connect(&path).await.unwrap();
        assert!(path.is_file());
        sqlx::query("INSERT INTO cache_entries (key, kind, value) VALUES ('k', 'string', 'v')")
            .execute(db.pool())
            .await
            .unwrap();
        db.close().await;

        let db = Database::connect(&path).await.unwrap();
        let (value,): (String,) =
            sqlx::query_as("SELECT value FROM cache_entries WHERE key = 'k'").fetch_one(db.pool()).await.unwrap();
        assert_eq!(value, "v");
        db.close().await;
    }

    #[tokio::test]
    async fn test_in_memory_connection_is_never_recycled() {
        let db = Database::connect_in_memory().await.unwrap();
        let options = db.pool().options();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_min_connections(), 1);
        assert_eq!(options.get_idle_timeout(), None);
        assert_eq!(options.get_max_lifetime(), None);

        sqlx::query("INSERT INTO cache_entries (key, kind, value) VALUES ('k', 'string', 'v')")
            .execute(db.pool())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache_entries").fetch_one(db.pool()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_file_pool_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(dir.path().join("cache.sqlite3")).await.unwrap();
        assert_eq!(db.pool().options().get_max_connections(), 4);
        assert!(db.pool().options().get_idle_timeout().is_some());
        db.close().await;
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Database::connect(dir.path().join("missing/cache.sqlite3")).await.is_err());
    }

    #[tokio::test]
    async fn test_migrating_twice() {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_settings() {
        let db = Database::connect_in_memory().await.unwrap();
        let (foreign_keys,): (i64,) = sqlx::query_as("PRAGMA foreign_keys").fetch_one(db.pool()).await.unwrap();
        assert_eq!(foreign_keys, 1);
        let (checkpoint,): (i64,) = sqlx::query_as("PRAGMA wal_autocheckpoint").fetch_one(db.pool()).await.unwrap();
        assert_eq!(checkpoint, 1000);
    }
}
