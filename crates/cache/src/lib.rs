//! SQLite cache database for burrow.
//!
//! This crate provides the cache that sits in front of the storage tree. The
//! cache is not the source of truth - the filesystem is. Any entry may be
//! deleted at any time (and expires on its own), after which it is simply
//! recomputed.
//!
//! # Architecture
//! The database holds two unrelated things:
//! - **Cache entries**: a Redis-flavoured key/value store (strings, hashes and
//!   sorted sets with optional TTLs) behind the [`CacheStore`] trait. Key
//!   names live in [`keys`].
//! - **Favorites**: bookmarked storage paths, persisted until removed.

mod db;
pub mod error;
mod favorites;
pub mod keys;
mod store;

pub use crate::db::{Database, Location};
pub use crate::favorites::{Favorite, FavoriteRepository};
pub use crate::store::{CacheStore, SqliteStore, StoreHandle};
