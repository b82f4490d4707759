//! One-shot multipart chunk upload.
//!
//! The simpler sibling of the resumable path, used by the recorder's
//! service-worker queue: one form post carries a whole chunk. It always
//! writes at offset zero, overwriting any partial prior attempt, and is
//! idempotent against retries of an already-received chunk.

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{parse_chunk_index, parse_session_id};
use crate::metrics;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Multipart, State};
use time::OffsetDateTime;
use waveforge_core::api::{FallbackStatus, FallbackUploadResponse};

/// POST /upload/chunk - Receive a whole chunk in one multipart request.
///
/// Creates the session implicitly when it does not exist yet; the record
/// stays half-known until a create-slot or completion request supplies the
/// session metadata.
#[tracing::instrument(skip(state, multipart))]
pub async fn upload_chunk_multipart(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<FallbackUploadResponse>> {
    let mut session_id_raw: Option<String> = None;
    let mut chunk_index_raw: Option<String> = None;
    let mut payload: Option<bytes::Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("session_id") => {
                session_id_raw = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("invalid session_id: {e}")))?,
                );
            }
            Some("chunk_index") => {
                chunk_index_raw = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("invalid chunk_index: {e}")))?,
                );
            }
            Some("file") => {
                payload = Some(field.bytes().await.map_err(|e| {
                    ApiError::BadRequest(format!("failed to read chunk bytes: {e}"))
                })?);
            }
            _ => {}
        }
    }

    let session_id = parse_session_id(
        &state,
        &session_id_raw
            .ok_or_else(|| ApiError::BadRequest("missing session_id field".to_string()))?,
    )?;
    let chunk_index = parse_chunk_index(
        &chunk_index_raw
            .ok_or_else(|| ApiError::BadRequest("missing chunk_index field".to_string()))?,
    )?;
    let payload =
        payload.ok_or_else(|| ApiError::BadRequest("missing file field".to_string()))?;
    if payload.len() as u64 > state.config.server.max_chunk_bytes {
        metrics::record_upload_error("payload_too_large");
        return Err(ApiError::PayloadTooLarge {
            limit: state.config.server.max_chunk_bytes,
        });
    }

    let now = OffsetDateTime::now_utc();
    let entry = state.registry.ensure_exists(&session_id, now).await;
    // Retry idempotency: a chunk that already made it to disk is not
    // rewritten, matching what the client expects from at-most-once effect.
    // A session that is assembling or assembled is sealed; late duplicates
    // from the client queue get the same already-exists answer.
    let already_persisted = {
        let record = entry.lock().await;
        record.chunks_persisted.contains(&chunk_index)
            || matches!(
                record.assembly_state,
                waveforge_core::session::AssemblyState::InProgress
                    | waveforge_core::session::AssemblyState::Done
            )
    };
    if already_persisted {
        tracing::debug!(
            session_id = %session_id,
            chunk_index,
            "Fallback chunk already persisted, skipping"
        );
        let mut record = entry.lock().await;
        record.touch(now);
        return Ok(Json(FallbackUploadResponse {
            status: FallbackStatus::ChunkAlreadyExists,
            chunk_index,
            session_id: session_id.to_string(),
        }));
    }

    let size = state
        .store
        .write_whole_chunk(&session_id, chunk_index, &payload)
        .await
        .map_err(|e| {
            let api: ApiError = e.into();
            if matches!(api, ApiError::StorageFull) {
                metrics::record_upload_error("storage_full");
            } else {
                metrics::record_upload_error("fallback_io");
            }
            api
        })?;

    metrics::CHUNKS_APPENDED.inc();
    metrics::BYTES_APPENDED.inc_by(size);

    let ready_for_assembly = {
        let mut record = entry.lock().await;
        record.mark_chunk_persisted(chunk_index, size);
        record.touch(now);
        record.completion_signalled && record.all_chunks_persisted()
    };
    if ready_for_assembly {
        state.coordinator.nudge(&session_id).await;
    }

    tracing::info!(
        session_id = %session_id,
        chunk_index,
        bytes = size,
        "Fallback chunk received"
    );
    Ok(Json(FallbackUploadResponse {
        status: FallbackStatus::ChunkReceived,
        chunk_index,
        session_id: session_id.to_string(),
    }))
}
