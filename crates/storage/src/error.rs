//! Storage error types.

use std::io::ErrorKind;
use thiserror::Error;

/// Chunk store operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("offset mismatch: declared {declared}, on-disk size is {actual}")]
    OffsetMismatch { declared: u64, actual: u64 },

    #[error("storage full")]
    StorageFull,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Map an I/O error, folding ENOSPC-class failures into `StorageFull`
    /// so the wire layer can tell clients to back off rather than retry.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => Self::StorageFull,
            _ => Self::Io(err),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
