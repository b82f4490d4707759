//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid session identifier: {0}")]
    InvalidSessionId(String),

    #[error("metadata conflict: {0}")]
    MetadataConflict(String),

    #[error("invalid chunk index: {index} (total_chunks is {total})")]
    InvalidChunkIndex { index: u32, total: u32 },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid assembly transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
