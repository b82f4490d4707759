//! Session-level handlers: status, completion signal, manual assemble,
//! cancel, and completed-artifact retrieval.

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{parse_session_id, rfc3339};
use crate::metrics;
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{Form, Path, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use serde::Deserialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tokio_util::io::ReaderStream;
use waveforge_core::api::{CancelResponse, CompletionResponse, StatusResponse};
use waveforge_core::session::{AssemblyOutcome, AssemblyState, SessionRecord};

fn status_body(record: &SessionRecord) -> StatusResponse {
    let artifact_path = match &record.assembly_result {
        Some(AssemblyOutcome::Completed { artifact }) => {
            Some(artifact.to_string_lossy().to_string())
        }
        _ => None,
    };
    StatusResponse {
        session_id: record.session_id.to_string(),
        total_chunks: record.total_chunks,
        persisted_count: record.chunks_persisted.len(),
        missing_indices: record.missing_indices(),
        assembly_state: record.assembly_state,
        artifact_path,
        completion_signalled: record.completion_signalled,
        recording_name: record.recording_name.clone(),
        format: record.format.clone(),
        created_at: rfc3339(record.created_at),
        last_activity_at: rfc3339(record.last_activity_at),
    }
}

/// GET /files/{session_id}/status - Session status.
///
/// Clients poll this to decide whether to send the completion signal and to
/// learn the assembly outcome.
#[tracing::instrument(skip(state), fields(session_id = %session_id))]
pub async fn get_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let session_id = parse_session_id(&state, &session_id)?;
    let now = OffsetDateTime::now_utc();
    let record = state
        .registry
        .update(&session_id, |rec| {
            rec.touch(now);
            rec.clone()
        })
        .await
        .ok_or_else(|| ApiError::UnknownSession(session_id.to_string()))?;
    Ok(Json(status_body(&record)))
}

/// Completion signal form body.
#[derive(Debug, Deserialize)]
pub struct CompleteForm {
    pub session_id: String,
    pub file_name: String,
    /// JSON blob of recording metadata; stored verbatim into the sidecar.
    #[serde(default)]
    pub metadata: Option<String>,
}

/// POST /recording/complete - The client asserts all chunks are queued.
///
/// Returns immediately with the post-transition state; the completion
/// coordinator retries in the background until every chunk is persisted.
#[tracing::instrument(skip(state, form), fields(session_id = %form.session_id))]
pub async fn recording_complete(
    State(state): State<AppState>,
    Form(form): Form<CompleteForm>,
) -> ApiResult<Json<CompletionResponse>> {
    let session_id = parse_session_id(&state, &form.session_id)?;
    if form.file_name.is_empty()
        || form.file_name.contains(['/', '\\'])
        || form.file_name.starts_with('.')
    {
        return Err(ApiError::BadRequest(format!(
            "unsafe file name: {:?}",
            form.file_name
        )));
    }

    let extra = match &form.metadata {
        Some(raw) => parse_metadata_blob(raw)?,
        None => BTreeMap::new(),
    };

    let now = OffsetDateTime::now_utc();

    // Fallback-only sessions have no create-time metadata; the completion
    // blob's totalChunks fills the gap, as it did for the service-worker
    // upload path.
    if let Some(total) = extra
        .get("totalChunks")
        .and_then(|raw| raw.parse::<u32>().ok())
        .filter(|total| *total > 0)
    {
        state
            .registry
            .update(&session_id, |rec| {
                if rec.total_chunks.is_none() {
                    let contradicted = rec
                        .chunks_persisted
                        .iter()
                        .next_back()
                        .is_some_and(|max| *max >= total);
                    if !contradicted {
                        rec.total_chunks = Some(total);
                    }
                }
            })
            .await;
    }

    let assembly_state = state
        .coordinator
        .signal(&session_id, Some(form.file_name.clone()), extra, now)
        .await
        .ok_or_else(|| ApiError::UnknownSession(session_id.to_string()))?;

    let record = state
        .registry
        .snapshot(&session_id)
        .await
        .ok_or_else(|| ApiError::UnknownSession(session_id.to_string()))?;

    tracing::info!(
        session_id = %session_id,
        file_name = %form.file_name,
        assembly_state = %assembly_state,
        persisted = record.chunks_persisted.len(),
        "Completion signal accepted"
    );

    Ok(Json(CompletionResponse {
        session_id: session_id.to_string(),
        assembly_state,
        file_name: Some(form.file_name),
        persisted_count: record.chunks_persisted.len(),
        total_chunks: record.total_chunks,
    }))
}

/// Flatten a client metadata JSON object into string pairs for the sidecar.
fn parse_metadata_blob(raw: &str) -> ApiResult<BTreeMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid metadata JSON: {e}")))?;
    let serde_json::Value::Object(object) = value else {
        return Err(ApiError::BadRequest(
            "metadata must be a JSON object".to_string(),
        ));
    };
    Ok(object
        .into_iter()
        .map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, rendered)
        })
        .collect())
}

/// POST /files/{session_id}/assemble - Manual assembly trigger.
///
/// Equivalent to the completion signal, without a payload; useful for
/// administrative recovery of a `failed` session. Idempotent.
#[tracing::instrument(skip(state), fields(session_id = %session_id))]
pub async fn trigger_assembly(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<CompletionResponse>> {
    let session_id = parse_session_id(&state, &session_id)?;
    let now = OffsetDateTime::now_utc();
    let assembly_state = state
        .coordinator
        .signal(&session_id, None, BTreeMap::new(), now)
        .await
        .ok_or_else(|| ApiError::UnknownSession(session_id.to_string()))?;

    let record = state
        .registry
        .snapshot(&session_id)
        .await
        .ok_or_else(|| ApiError::UnknownSession(session_id.to_string()))?;

    Ok(Json(CompletionResponse {
        session_id: session_id.to_string(),
        assembly_state,
        file_name: record.artifact_file_name(),
        persisted_count: record.chunks_persisted.len(),
        total_chunks: record.total_chunks,
    }))
}

/// DELETE /files/{session_id} - Cancel a session and remove its storage.
///
/// Refused while assembly is running; a `done` session may still be
/// cancelled to free storage ahead of the retention window.
#[tracing::instrument(skip(state), fields(session_id = %session_id))]
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let session_id = parse_session_id(&state, &session_id)?;
    let record = state
        .registry
        .snapshot(&session_id)
        .await
        .ok_or_else(|| ApiError::UnknownSession(session_id.to_string()))?;
    if record.assembly_state == AssemblyState::InProgress {
        return Err(ApiError::AssemblyInProgress);
    }

    state.registry.delete(&session_id).await;
    state.store.delete_session(&session_id).await?;
    metrics::SESSIONS_ACTIVE.set(state.registry.len().await as i64);

    tracing::info!(session_id = %session_id, "Session cancelled");
    Ok(Json(CancelResponse {
        session_id: session_id.to_string(),
        cancelled: true,
    }))
}

/// GET /recordings/{session_id}/{file_name} - Stream a completed artifact.
#[tracing::instrument(skip(state), fields(session_id = %session_id))]
pub async fn get_recording(
    State(state): State<AppState>,
    Path((session_id, file_name)): Path<(String, String)>,
) -> ApiResult<Response> {
    let session_id = parse_session_id(&state, &session_id)?;

    let (file, size) = state
        .store
        .open_completed(&session_id, &file_name)
        .await
        .map_err(|e| match e {
            waveforge_storage::StorageError::NotFound(_) => ApiError::NotFound(format!(
                "recording not found: {session_id}/{file_name}"
            )),
            other => other.into(),
        })?;

    let media_type = media_type_for(&file_name);
    let body = Body::from_stream(ReaderStream::new(file));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, media_type)
        .header(header::CONTENT_LENGTH, size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(body)
        .map_err(|e| ApiError::Internal(format!("failed to build response: {e}")))?;
    Ok(response)
}

fn media_type_for(file_name: &str) -> &'static str {
    match file_name.rsplit_once('.').map(|(_, ext)| ext) {
        Some(ext) if ext.eq_ignore_ascii_case("webm") => "audio/webm",
        Some(ext) if ext.eq_ignore_ascii_case("wav") => "audio/wav",
        Some(ext) if ext.eq_ignore_ascii_case("mp3") => "audio/mpeg",
        Some(ext) if ext.eq_ignore_ascii_case("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_types_cover_recorder_formats() {
        assert_eq!(media_type_for("a.webm"), "audio/webm");
        assert_eq!(media_type_for("a.WAV"), "audio/wav");
        assert_eq!(media_type_for("a.mp3"), "audio/mpeg");
        assert_eq!(media_type_for("a.ogg"), "audio/ogg");
        assert_eq!(media_type_for("a.bin"), "application/octet-stream");
        assert_eq!(media_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn metadata_blob_flattens_scalars() {
        let parsed =
            parse_metadata_blob(r#"{"name":"demo","duration":12.5,"totalChunks":3}"#).unwrap();
        assert_eq!(parsed["name"], "demo");
        assert_eq!(parsed["duration"], "12.5");
        assert_eq!(parsed["totalChunks"], "3");

        assert!(parse_metadata_blob("not json").is_err());
        assert!(parse_metadata_blob(r#"["a"]"#).is_err());
    }
}
