//! Persistent favorites.
//!
//! Unlike everything else in the cache database, favorites are user data:
//! they are the one table that is never cleared by TTLs or invalidation.

use crate::Database;
use crate::error::{Error, ErrorKind, Result};
use burrow_storage::StoragePath;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;

/// A bookmarked file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Favorite {
    pub id: i64,
    pub name: String,
    pub path: StoragePath,
    pub is_dir: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(sqlx::FromRow)]
struct FavoriteRow {
    id: i64,
    name: String,
    path: String,
    is_dir: bool,
    created_at: i64,
}
impl TryFrom<FavoriteRow> for Favorite {
    type Error = Error;
    fn try_from(row: FavoriteRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            path: StoragePath::parse(&row.path).or_raise(|| ErrorKind::InvalidData("favorite path"))?,
            is_dir: row.is_dir,
            created_at: OffsetDateTime::from_unix_timestamp(row.created_at)
                .or_raise(|| ErrorKind::InvalidData("favorite creation date"))?,
        })
    }
}

/// Repository for the `favorites` table.
#[derive(Debug, Clone)]
pub struct FavoriteRepository {
    pool: SqlitePool,
}
impl From<&Database> for FavoriteRepository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl FavoriteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a favorite. Adding a path that is already a favorite returns the
    /// existing record untouched.
    pub async fn insert(&self, name: &str, path: &StoragePath, is_dir: bool) -> Result<Favorite> {
        let canonical = path.to_string();
        sqlx::query(include_str!("../queries/favorite_insert.sql"))
            .bind(name)
            .bind(&canonical)
            .bind(is_dir)
            .bind(OffsetDateTime::now_utc().unix_timestamp())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        match self.get(path).await? {
            Some(favorite) => Ok(favorite),
            // Only possible if it was removed again in between.
            None => exn::bail!(ErrorKind::InvalidData("favorite vanished after insert")),
        }
    }

    pub async fn get(&self, path: &StoragePath) -> Result<Option<Favorite>> {
        let row: Option<FavoriteRow> = sqlx::query_as(include_str!("../queries/favorite_get_by_path.sql"))
            .bind(path.to_string())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Favorite::try_from).transpose()
    }

    /// Returns `true` if the path was a favorite.
    pub async fn remove(&self, path: &StoragePath) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/favorite_delete.sql"))
            .bind(path.to_string())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Every favorite, newest first.
    pub async fn list(&self) -> Result<Vec<Favorite>> {
        let rows: Vec<FavoriteRow> = sqlx::query_as(include_str!("../queries/favorite_list.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Favorite::try_from).collect::<Result<Vec<_>>>()
    }
}
