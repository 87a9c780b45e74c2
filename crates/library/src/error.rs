//! Library Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Failures from the lower crates are
//! wrapped with `or_raise` so the tree keeps their original kind.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The path does not belong to any configured root.
    #[display("not a library path: {}", _0.display())]
    OutsideRoots(#[error(not(source))] PathBuf),
    #[display("filesystem error")]
    Storage,
    #[display("folder cache error")]
    Cache,
    #[display("database error")]
    Database,
    #[display("could not watch {}", _0.display())]
    Watch(#[error(not(source))] PathBuf),
    /// A collaborator outside this crate (notification sink, metadata service) failed.
    #[display("external service error: {_0}")]
    External(#[error(not(source))] String),
    #[display("operation cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage | Self::Cache | Self::Database | Self::External(_) => true,
            Self::OutsideRoots(_) | Self::Watch(_) | Self::Cancelled => false,
        }
    }
}
