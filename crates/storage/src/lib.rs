//! On-disk chunk storage for WaveForge.
//!
//! This crate owns everything under the storage root:
//! - Sharded chunk files with append-at-offset semantics
//! - Completed artifacts published via temp-file + fsync + atomic rename
//! - Sidecar metadata files
//! - Session enumeration for registry rehydration

pub mod chunk_store;
pub mod error;

pub use chunk_store::{ByteStream, ChunkStore, CompletedUpload, SessionScan};
pub use error::{StorageError, StorageResult};
