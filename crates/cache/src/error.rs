//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// Serialization/deserialization error.
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// A value-type operation (hash, sorted set) against a key that holds a
    /// different type of value.
    #[display("cache key {key} holds a {actual} value, not a {expected}")]
    WrongType { key: String, expected: &'static str, actual: String },
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        // SQLITE_BUSY surfaces as a database error.
        matches!(self, Self::Database)
    }
}
