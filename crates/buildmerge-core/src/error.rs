//! Error types for BuildMerge.

use thiserror::Error;

/// Crate-wide error.
///
/// Cloneable so a single failed cache load can be handed to every
/// caller waiting on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown builder: {0}")]
    UnknownBuilder(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Configuration errors are fatal to a submission and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::UnknownBuilder(_))
    }

    /// Store errors are transient; the caller may retry the whole submission.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
