//! Wire DTOs for the protocol surface.
//!
//! Header-carried values (offsets, tus metadata) never appear here; these
//! are the JSON bodies only.

use crate::session::AssemblyState;
use serde::{Deserialize, Serialize};

/// Response body for the session status verb.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub session_id: String,
    /// `None` while the record is half-known after a restart.
    pub total_chunks: Option<u32>,
    pub persisted_count: usize,
    pub missing_indices: Vec<u32>,
    pub assembly_state: AssemblyState,
    /// Path of the completed artifact, present iff assembly is done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    pub completion_signalled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub created_at: String,
    pub last_activity_at: String,
}

/// Response body for the chunk verify verb.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_on_disk: Option<u64>,
    /// Storage-root-relative location, for operator diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_hint: Option<String>,
}

/// Response body for the completion signal and the manual assemble verb.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub session_id: String,
    /// Assembly state after the signal was applied.
    pub assembly_state: AssemblyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub persisted_count: usize,
    /// `None` while the record is half-known.
    pub total_chunks: Option<u32>,
}

/// Outcome of a one-shot fallback chunk upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStatus {
    ChunkReceived,
    ChunkAlreadyExists,
}

/// Response body for the fallback multipart upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FallbackUploadResponse {
    pub status: FallbackStatus,
    pub chunk_index: u32,
    pub session_id: String,
}

/// Response body for the cancel verb.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub session_id: String,
    pub cancelled: bool,
}

/// Liveness token for the health probe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}
