//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// What kind of thing occupies a path.
///
/// Carried by [`ErrorKind::AlreadyExists`] so that "a folder is already
/// there" and "a file is already there" produce distinct messages while
/// remaining the same actionable category.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    #[display("directory")]
    Directory,
    #[display("file")]
    File,
}
impl EntryKind {
    pub fn from_is_dir(is_dir: bool) -> Self {
        match is_dir {
            true => Self::Directory,
            false => Self::File,
        }
    }
}

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Empty or malformed path/name, or a path that escapes the storage root.
    #[display("invalid argument: {_0}")]
    InvalidArgument(#[error(not(source))] String),
    /// Operation target is absent where presence is required.
    #[display("not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Conflicting create/rename/move/copy/merge target.
    #[display("{kind} already exists: {}", path.display())]
    AlreadyExists { path: PathBuf, kind: EntryKind },
    /// Non-forced delete of a populated directory.
    #[display("directory not empty: {}", _0.display())]
    DirectoryNotEmpty(#[error(not(source))] PathBuf),
    /// Access denied, or the write probe failed.
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// A chunk expected by a merge is not present.
    #[display("chunk {index} of {total} is missing")]
    ChunkMissing { index: u32, total: u32 },
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Map an I/O error onto the category a caller can act on, keeping the
    /// path that was being operated on.
    pub fn from_io(err: IoError, path: impl Into<PathBuf>) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.into()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.into()),
            std::io::ErrorKind::DirectoryNotEmpty => Self::DirectoryNotEmpty(path.into()),
            _ => Self::Io(err),
        }
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ChunkMissing { .. })
    }
}
