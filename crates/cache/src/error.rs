//! Cache Error Types
//!
//! A failed population is handed to every caller waiting on it, so the error
//! kind is `Clone` and is shared by value rather than as an error tree.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ErrorKind {
    /// The path is outside every root, or the node does not exist.
    #[display("not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Expected a folder (or a file) and found the other.
    #[display("wrong node type: {}", _0.display())]
    WrongNodeType(#[error(not(source))] PathBuf),
    /// Reading the folder from storage failed.
    #[display("failed to load folder: {}", _0.display())]
    Storage(#[error(not(source))] PathBuf),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Classify a storage failure for `path`.
    pub(crate) fn from_storage(err: &folio_storage::error::ErrorKind, path: impl Into<PathBuf>) -> Self {
        use folio_storage::error::ErrorKind as Storage;
        match err {
            Storage::OutsideRoots(_) | Storage::NotFound(_) => Self::NotFound(path.into()),
            Storage::WrongNodeType(_) => Self::WrongNodeType(path.into()),
            _ => Self::Storage(path.into()),
        }
    }
}
