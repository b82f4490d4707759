//! Shared handler helpers.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::BTreeMap;
use waveforge_core::session::{SessionId, SessionMeta};

/// Parse and validate a session identifier from a path segment, using the
/// configured alphabet. Rejection happens before any filesystem access.
pub fn parse_session_id(state: &AppState, raw: &str) -> ApiResult<SessionId> {
    SessionId::parse_with_alphabet(raw, &state.config.sessions.id_alphabet)
        .map_err(ApiError::from)
}

/// Parse a chunk index path segment.
pub fn parse_chunk_index(raw: &str) -> ApiResult<u32> {
    raw.parse::<u32>()
        .map_err(|_| ApiError::BadRequest(format!("invalid chunk index: {raw}")))
}

/// Parse a tus `Upload-Metadata` header: comma-separated `key base64value`
/// pairs. A value that fails to decode as base64/UTF-8 is kept raw, which is
/// what the recorder client has historically relied on.
pub fn parse_tus_metadata(header: Option<&str>) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    let Some(header) = header else {
        return metadata;
    };
    for pair in header.split(',') {
        let pair = pair.trim();
        let Some((key, value)) = pair.split_once(' ') else {
            if !pair.is_empty() {
                metadata.insert(pair.to_string(), String::new());
            }
            continue;
        };
        let decoded = BASE64
            .decode(value.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_else(|| value.trim().to_string());
        metadata.insert(key.to_string(), decoded);
    }
    metadata
}

/// Extract `(chunk_index, SessionMeta)` from decoded tus metadata.
///
/// Recognized keys follow the recorder client: `chunkIndex`, `totalChunks`,
/// `recordingName`, `format`, `totalBytes`. Everything else is passthrough.
pub fn session_meta_from_tus(
    mut metadata: BTreeMap<String, String>,
) -> ApiResult<(u32, SessionMeta)> {
    let chunk_index = match metadata.remove("chunkIndex") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| ApiError::BadRequest(format!("invalid chunkIndex: {raw}")))?,
        None => 0,
    };
    let total_chunks = metadata
        .remove("totalChunks")
        .ok_or_else(|| ApiError::BadRequest("missing totalChunks metadata".to_string()))?
        .parse::<u32>()
        .map_err(|_| ApiError::BadRequest("invalid totalChunks metadata".to_string()))?;
    let recording_name = metadata
        .remove("recordingName")
        .unwrap_or_else(|| "recording".to_string());
    let format = metadata.remove("format").unwrap_or_else(|| "webm".to_string());
    let expected_total_bytes = match metadata.remove("totalBytes") {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| ApiError::BadRequest("invalid totalBytes metadata".to_string()))?,
        ),
        None => None,
    };

    let meta = SessionMeta {
        total_chunks,
        recording_name,
        format,
        expected_total_bytes,
        extra: metadata,
    };
    meta.validate()?;
    Ok((chunk_index, meta))
}

/// Format a timestamp for JSON responses.
pub fn rfc3339(ts: time::OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| ts.to_string())
}
