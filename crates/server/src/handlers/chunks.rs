//! Resumable chunk upload handlers: create slot, append, probe, verify.

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{parse_chunk_index, parse_session_id, parse_tus_metadata, session_meta_from_tus};
use crate::metrics;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Instant;
use time::OffsetDateTime;
use waveforge_core::api::VerifyResponse;
use waveforge_core::session::{AssemblyState, SessionRecord};

/// Extra slack over `max_chunk_bytes` when reading append bodies, so the
/// over-limit check below is what rejects, with the right error code.
const BODY_READ_SLACK: u64 = 1024;

fn tus_headers(offset: u64) -> [(&'static str, String); 2] {
    [
        ("Upload-Offset", offset.to_string()),
        ("Tus-Resumable", "1.0.0".to_string()),
    ]
}

/// Reject mutation verbs while the session is assembling or assembled.
fn check_mutable(record: &SessionRecord) -> ApiResult<()> {
    match record.assembly_state {
        AssemblyState::InProgress => Err(ApiError::AssemblyInProgress),
        AssemblyState::Done => Err(ApiError::Conflict(
            "session is already assembled".to_string(),
        )),
        _ => Ok(()),
    }
}

/// POST /files/{session_id}/chunks/ - Create (or re-open) a chunk slot.
///
/// Carries tus `Upload-Metadata`; re-issuing for an existing chunk returns
/// the same resource location and the current accepted offset, which is how
/// clients resume after a crash.
#[tracing::instrument(skip(state, headers), fields(session_id = %session_id))]
pub async fn create_chunk_slot(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let session_id = parse_session_id(&state, &session_id)?;
    let metadata = parse_tus_metadata(
        headers
            .get("Upload-Metadata")
            .and_then(|value| value.to_str().ok()),
    );
    let (chunk_index, meta) = session_meta_from_tus(metadata)?;
    let announced_len = match headers.get("Upload-Length") {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|raw| raw.parse::<u64>().ok())
                .ok_or_else(|| ApiError::BadRequest("invalid Upload-Length".to_string()))?,
        ),
        None => None,
    };

    let now = OffsetDateTime::now_utc();
    let existed = state.registry.snapshot(&session_id).await.is_some();
    let record = state
        .registry
        .get_or_create(&session_id, &meta, now)
        .await?;
    check_mutable(&record)?;
    record.check_chunk_index(chunk_index)?;
    if !existed {
        metrics::SESSIONS_CREATED.inc();
        metrics::SESSIONS_ACTIVE.set(state.registry.len().await as i64);
    }

    state.store.ensure_chunk_slot(&session_id, chunk_index).await?;
    // Resume support: a slot that already holds bytes reports its offset.
    let offset = state
        .store
        .size_of(&session_id, chunk_index)
        .await?
        .unwrap_or(0);

    if let Some(len) = announced_len {
        state
            .registry
            .update(&session_id, |rec| {
                rec.announced_sizes.insert(chunk_index, len);
                // The slot may already be full from a previous life.
                if offset >= len && len > 0 {
                    rec.mark_chunk_persisted(chunk_index, offset);
                }
            })
            .await;
    }

    tracing::info!(
        session_id = %session_id,
        chunk_index,
        total_chunks = meta.total_chunks,
        offset,
        "Chunk slot ready"
    );

    let location = format!("/files/{session_id}/chunks/{chunk_index}");
    Ok((
        StatusCode::CREATED,
        [
            ("Location", location),
            ("Upload-Offset", offset.to_string()),
            ("Tus-Resumable", "1.0.0".to_string()),
        ],
    )
        .into_response())
}

/// PATCH /files/{session_id}/chunks/{chunk_index} - Append bytes.
///
/// The declared `Upload-Offset` must equal the on-disk size; a mismatch
/// returns 409 with the actual offset so the client can correct and retry.
/// An `Upload-Complete: 1` header marks the chunk final regardless of the
/// announced size.
#[tracing::instrument(skip(state, req), fields(session_id = %session_id, chunk_index = %chunk_index))]
pub async fn append_chunk(
    State(state): State<AppState>,
    Path((session_id, chunk_index)): Path<(String, String)>,
    req: Request,
) -> ApiResult<Response> {
    let started = Instant::now();
    let session_id = parse_session_id(&state, &session_id)?;
    let chunk_index = parse_chunk_index(&chunk_index)?;

    let declared_offset = req
        .headers()
        .get("Upload-Offset")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse::<u64>().ok())
        .ok_or_else(|| ApiError::BadRequest("missing or invalid Upload-Offset".to_string()))?;
    let client_final = req
        .headers()
        .get("Upload-Complete")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"));

    let max_bytes = state.config.server.max_chunk_bytes;
    if let Some(length) = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse::<u64>().ok())
    {
        if length > max_bytes {
            metrics::record_upload_error("payload_too_large");
            return Err(ApiError::PayloadTooLarge { limit: max_bytes });
        }
    }

    let record = state
        .registry
        .snapshot(&session_id)
        .await
        .ok_or_else(|| ApiError::UnknownSession(session_id.to_string()))?;
    if record.is_half_known() {
        return Err(ApiError::MetadataConflict(
            "session metadata lost on restart; re-create the chunk slot first".to_string(),
        ));
    }
    check_mutable(&record)?;
    record.check_chunk_index(chunk_index)?;

    let body = axum::body::to_bytes(req.into_body(), (max_bytes + BODY_READ_SLACK) as usize)
        .await
        .map_err(|_| {
            metrics::record_upload_error("payload_too_large");
            ApiError::PayloadTooLarge { limit: max_bytes }
        })?;
    if body.len() as u64 > max_bytes {
        metrics::record_upload_error("payload_too_large");
        return Err(ApiError::PayloadTooLarge { limit: max_bytes });
    }

    let new_offset = state
        .store
        .append_at(&session_id, chunk_index, declared_offset, &body)
        .await
        .map_err(|e| {
            let api: ApiError = e.into();
            match &api {
                ApiError::OffsetMismatch { .. } => {
                    metrics::OFFSET_MISMATCHES.inc();
                    metrics::record_upload_error("offset_mismatch");
                }
                ApiError::StorageFull => metrics::record_upload_error("storage_full"),
                _ => metrics::record_upload_error("append_io"),
            }
            api
        })?;

    metrics::CHUNKS_APPENDED.inc();
    metrics::BYTES_APPENDED.inc_by(body.len() as u64);

    let now = OffsetDateTime::now_utc();
    let ready_for_assembly = state
        .registry
        .update(&session_id, |rec| {
            rec.record_append(chunk_index, new_offset, client_final);
            rec.touch(now);
            rec.completion_signalled && rec.all_chunks_persisted()
        })
        .await
        .unwrap_or(false);
    if ready_for_assembly {
        // Last chunk of a signalled session: skip the coordinator backoff.
        state.coordinator.nudge(&session_id).await;
    }

    metrics::APPEND_DURATION.observe(started.elapsed().as_secs_f64());
    tracing::debug!(
        session_id = %session_id,
        chunk_index,
        declared_offset,
        new_offset,
        bytes = body.len(),
        client_final,
        "Chunk bytes accepted"
    );

    Ok((StatusCode::NO_CONTENT, tus_headers(new_offset)).into_response())
}

/// HEAD /files/{session_id}/chunks/{chunk_index} - Probe the accepted offset.
///
/// The basis of crash-resume: the client probes, then re-appends from the
/// returned offset. The on-disk size is authoritative and refreshes the
/// registry's advisory offset.
#[tracing::instrument(skip(state), fields(session_id = %session_id, chunk_index = %chunk_index))]
pub async fn probe_chunk(
    State(state): State<AppState>,
    Path((session_id, chunk_index)): Path<(String, String)>,
) -> ApiResult<Response> {
    let session_id = parse_session_id(&state, &session_id)?;
    let chunk_index = parse_chunk_index(&chunk_index)?;

    let record = state
        .registry
        .snapshot(&session_id)
        .await
        .ok_or_else(|| ApiError::UnknownSession(session_id.to_string()))?;
    record.check_chunk_index(chunk_index)?;

    let offset = state
        .store
        .size_of(&session_id, chunk_index)
        .await?
        .unwrap_or(0);

    let now = OffsetDateTime::now_utc();
    state
        .registry
        .update(&session_id, |rec| {
            if offset > 0 {
                rec.chunk_offsets.insert(chunk_index, offset);
            }
            rec.touch(now);
        })
        .await;

    Ok((StatusCode::OK, tus_headers(offset)).into_response())
}

/// GET /files/{session_id}/chunks/{chunk_index}/verify - Confirm persistence.
///
/// Optional for correctness; clients use it to double-check a chunk landed
/// before discarding their local copy.
#[tracing::instrument(skip(state), fields(session_id = %session_id, chunk_index = %chunk_index))]
pub async fn verify_chunk(
    State(state): State<AppState>,
    Path((session_id, chunk_index)): Path<(String, String)>,
) -> ApiResult<Json<VerifyResponse>> {
    let session_id = parse_session_id(&state, &session_id)?;
    let chunk_index = parse_chunk_index(&chunk_index)?;

    let record = state
        .registry
        .snapshot(&session_id)
        .await
        .ok_or_else(|| ApiError::UnknownSession(session_id.to_string()))?;
    record.check_chunk_index(chunk_index)?;

    let size = state.store.size_of(&session_id, chunk_index).await?;
    let now = OffsetDateTime::now_utc();
    state
        .registry
        .update(&session_id, |rec| rec.touch(now))
        .await;

    Ok(Json(VerifyResponse {
        exists: size.is_some(),
        size_on_disk: size,
        path_hint: size
            .is_some()
            .then(|| state.store.chunk_path_hint(&session_id, chunk_index)),
    }))
}
