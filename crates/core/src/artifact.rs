//! Sidecar metadata written next to a completed artifact.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Contents of the `{artifact}.meta` sidecar file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub session_id: String,
    pub file_name: String,
    pub total_chunks: u32,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    /// Passthrough metadata from session creation and the completion signal.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub client_metadata: BTreeMap<String, String>,
}
