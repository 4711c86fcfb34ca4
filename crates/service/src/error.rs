//! Service Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Storage failures are raised into
//! this taxonomy with the original storage error kept as a child frame.

use burrow_storage::error::{EntryKind, Error as StorageError, ErrorKind as StorageErrorKind};
use derive_more::{Display, Error};
use std::path::PathBuf;

/// A service error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies a failure by what the caller should do about it.
///
/// ### Client Errors
/// - [`ErrorKind::InvalidArgument`]
/// - [`ErrorKind::NotFound`]
/// - [`ErrorKind::AlreadyExists`]
/// - [`ErrorKind::DirectoryNotEmpty`]
/// - [`ErrorKind::PermissionDenied`]
/// - [`ErrorKind::ChunkMissing`] - re-send the missing part and retry.
///
/// ### Dependency Errors
/// - [`ErrorKind::Io`]
/// - [`ErrorKind::Cache`]
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("invalid argument: {_0}")]
    InvalidArgument(#[error(not(source))] String),
    #[display("not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    #[display("{kind} already exists: {}", path.display())]
    AlreadyExists { path: PathBuf, kind: EntryKind },
    #[display("directory not empty: {}", _0.display())]
    DirectoryNotEmpty(#[error(not(source))] PathBuf),
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    #[display("chunk {index} of {total} is missing")]
    ChunkMissing { index: u32, total: u32 },
    /// The filesystem failed in a way the caller can't fix.
    #[display("storage I/O error")]
    Io,
    /// The cache database failed on a path where it can't be bypassed.
    #[display("cache unavailable")]
    Cache,
}

impl ErrorKind {
    /// Raise a storage error into the service taxonomy, keeping the storage
    /// frame as its child.
    pub fn storage(err: StorageError) -> Error {
        let kind = match &*err {
            StorageErrorKind::InvalidArgument(message) => Self::InvalidArgument(message.clone()),
            StorageErrorKind::NotFound(path) => Self::NotFound(path.clone()),
            StorageErrorKind::AlreadyExists { path, kind } => Self::AlreadyExists { path: path.clone(), kind: *kind },
            StorageErrorKind::DirectoryNotEmpty(path) => Self::DirectoryNotEmpty(path.clone()),
            StorageErrorKind::PermissionDenied(path) => Self::PermissionDenied(path.clone()),
            StorageErrorKind::ChunkMissing { index, total } => Self::ChunkMissing { index: *index, total: *total },
            StorageErrorKind::Io(_) => Self::Io,
        };
        err.raise(kind)
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io | Self::Cache | Self::ChunkMissing { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_keep_their_category() {
        let err = exn::Exn::from(StorageErrorKind::DirectoryNotEmpty(PathBuf::from("/a")));
        let raised = ErrorKind::storage(err);
        assert!(matches!(&*raised, ErrorKind::DirectoryNotEmpty(path) if path == &PathBuf::from("/a")));

        let err = exn::Exn::from(StorageErrorKind::AlreadyExists { path: PathBuf::from("/b"), kind: EntryKind::File });
        let raised = ErrorKind::storage(err);
        assert_eq!((*raised).to_string(), "file already exists: /b");
    }

    #[test]
    fn test_io_is_retryable() {
        let err = exn::Exn::from(StorageErrorKind::Io(std::io::Error::other("disk on fire")));
        assert!(ErrorKind::storage(err).is_retryable());
        assert!(!ErrorKind::InvalidArgument("x".to_string()).is_retryable());
    }
}
