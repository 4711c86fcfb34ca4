//! Key/value cache store.
//!
//! A small, Redis-flavoured subset: string values, hashes and sorted sets,
//! each with an optional time-to-live. Expired entries are never returned;
//! they are physically removed lazily (on the next write to the same key) or
//! in bulk by [`purge_expired()`](CacheStore::purge_expired).

use crate::Database;
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

pub type StoreHandle = Arc<dyn CacheStore + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    String,
    Hash,
    SortedSet,
}
impl ValueKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Hash => "hash",
            Self::SortedSet => "zset",
        }
    }
}

/// Cache operations needed by the metadata layer.
///
/// Implementations must treat an entry whose TTL has elapsed exactly as if it
/// did not exist.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// String value of `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace `key` (whatever type it held) with a string value.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key matching a SQLite `GLOB` pattern (see
    /// [`escape_glob()`](crate::keys::escape_glob)). Returns the number of keys
    /// removed.
    async fn delete_matching(&self, pattern: &str) -> Result<u64>;

    /// Set a new TTL on an existing key. Returns `false` if the key does not
    /// exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Increment an integer hash field (missing fields start from zero) and
    /// return the new value.
    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64>;

    /// Remove one hash field. Returns `false` if the key or field does not
    /// exist.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    /// Every field of a hash; empty if the key does not exist.
    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>>;

    /// Add a member to a sorted set, or update its score.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Keep only the `keep` highest-scoring members. Returns how many were
    /// removed.
    async fn ztrim(&self, key: &str, keep: usize) -> Result<u64>;

    /// Up to `limit` members, highest score first.
    async fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<String>>;

    /// Physically remove every expired entry. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64>;
}

fn now_millis() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn expires_at(ttl: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn wrong_type(key: &str, expected: ValueKind, actual: String) -> ErrorKind {
    ErrorKind::WrongType { key: key.to_string(), expected: expected.as_str(), actual }
}

/// [`CacheStore`] persisted in the SQLite cache database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}
impl From<&Database> for SqliteStore {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Make sure `key` holds a live value of the given kind inside `tx`,
    /// creating an empty one if needed.
    ///
    /// The first statement is a write, so the transaction takes SQLite's
    /// write lock straight away instead of failing to upgrade later.
    async fn prepare(tx: &mut Transaction<'_, Sqlite>, key: &str, kind: ValueKind) -> Result<()> {
        sqlx::query(include_str!("../queries/drop_if_expired.sql"))
            .bind(key)
            .bind(now_millis())
            .execute(&mut **tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let existing: Option<(String,)> = sqlx::query_as(include_str!("../queries/kind_of.sql"))
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        match existing {
            Some((actual,)) if actual == kind.as_str() => Ok(()),
            Some((actual,)) => exn::bail!(wrong_type(key, kind, actual)),
            None => {
                sqlx::query(include_str!("../queries/insert_entry.sql"))
                    .bind(key)
                    .bind(kind.as_str())
                    .bind(None::<String>)
                    .bind(None::<i64>)
                    .execute(&mut **tx)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                Ok(())
            },
        }
    }

    /// Kind of the live value at `key`, checked against what the caller
    /// expects. `false` if there is no live value.
    async fn check_live(&self, key: &str, kind: ValueKind) -> Result<bool> {
        let live: Option<(String,)> = sqlx::query_as(include_str!("../queries/live_kind.sql"))
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        match live {
            None => Ok(false),
            Some((actual,)) if actual == kind.as_str() => Ok(true),
            Some((actual,)) => exn::bail!(wrong_type(key, kind, actual)),
        }
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String, Option<String>)> = sqlx::query_as(include_str!("../queries/get_string.sql"))
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        match row {
            None => Ok(None),
            Some((kind, value)) if kind == ValueKind::String.as_str() => Ok(value),
            Some((kind, _)) => exn::bail!(wrong_type(key, ValueKind::String, kind)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        // Deleting first also drops any hash fields or sorted-set members
        // left behind by a previous value of another kind.
        sqlx::query(include_str!("../queries/delete_entry.sql"))
            .bind(key)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/insert_entry.sql"))
            .bind(key)
            .bind(ValueKind::String.as_str())
            .bind(value)
            .bind(ttl.map(expires_at))
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/delete_entry.sql"))
            .bind(key)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/delete_matching.sql"))
            .bind(pattern)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/expire_entry.sql"))
            .bind(key)
            .bind(expires_at(ttl))
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        Self::prepare(&mut tx, key, ValueKind::Hash).await?;
        sqlx::query(include_str!("../queries/hash_set_field.sql"))
            .bind(key)
            .bind(field)
            .bind(value)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        Self::prepare(&mut tx, key, ValueKind::Hash).await?;
        let current: Option<(String,)> = sqlx::query_as(include_str!("../queries/hash_get_field.sql"))
            .bind(key)
            .bind(field)
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let current = match current {
            Some((value,)) => value.parse::<i64>().or_raise(|| ErrorKind::InvalidData("hash field is not an integer"))?,
            None => 0,
        };
        let next = current.checked_add(by).ok_or(ErrorKind::InvalidData("hash field increment overflows"))?;
        sqlx::query(include_str!("../queries/hash_set_field.sql"))
            .bind(key)
            .bind(field)
            .bind(next.to_string())
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(next)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        if !self.check_live(key, ValueKind::Hash).await? {
            return Ok(false);
        }
        let result = sqlx::query(include_str!("../queries/hash_delete_field.sql"))
            .bind(key)
            .bind(field)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        if !self.check_live(key, ValueKind::Hash).await? {
            return Ok(BTreeMap::new());
        }
        let rows: Vec<(String, String)> = sqlx::query_as(include_str!("../queries/hash_get_all.sql"))
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        Self::prepare(&mut tx, key, ValueKind::SortedSet).await?;
        sqlx::query(include_str!("../queries/zset_add.sql"))
            .bind(key)
            .bind(member)
            .bind(score)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn ztrim(&self, key: &str, keep: usize) -> Result<u64> {
        if !self.check_live(key, ValueKind::SortedSet).await? {
            return Ok(0);
        }
        let keep = i64::try_from(keep).or_raise(|| ErrorKind::InvalidData("limit"))?;
        let result = sqlx::query(include_str!("../queries/zset_trim.sql"))
            .bind(key)
            .bind(keep)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    async fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        if !self.check_live(key, ValueKind::SortedSet).await? {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).or_raise(|| ErrorKind::InvalidData("limit"))?;
        let rows: Vec<(String,)> = sqlx::query_as(include_str!("../queries/zset_rev_range.sql"))
            .bind(key)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().map(|(member,)| member).collect())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/purge_expired.sql"))
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() > 0 {
            tracing::debug!(purged = result.rows_affected(), "Purged expired cache entries");
        }
        Ok(result.rows_affected())
    }
}
