use crate::ids::{OwnerId, ShortKey};
use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The original URL is already stored; carries the existing key.
    #[error("original url already shortened as {0}")]
    Conflict(ShortKey),
    #[error("short key {0} does not exist")]
    NotFound(ShortKey),
    #[error("short key {0} has been deleted")]
    Gone(ShortKey),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// The owner id lies outside the range an allocator can issue.
    #[error("owner id {0} cannot be issued")]
    InvalidOwner(OwnerId),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error("malformed persisted record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },
}

impl StorageError {
    /// Whether a failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable(_) | StorageError::Timeout(_) | StorageError::Query(_)
        )
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}
