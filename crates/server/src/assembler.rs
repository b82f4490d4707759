//! Background assembly of a session's chunks into the final artifact.
//!
//! The caller owns the `pending -> in_progress` CAS; `run_assembly` is
//! entered only after it succeeded, and every exit path below writes a
//! terminal (or demoted) state back into the registry before returning.

use crate::metrics;
use crate::registry::SessionRegistry;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use waveforge_core::session::{AssemblyOutcome, AssemblyState, SessionId};
use waveforge_core::{AppConfig, ArtifactMeta};
use waveforge_storage::ChunkStore;

/// How an assembly run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum AssemblyRun {
    /// Artifact published; session is `done`.
    Completed,
    /// Chunks were missing after all; session went back to `pending`.
    Demoted,
    /// A storage error ended the run; session is `failed`, chunks kept.
    Failed,
}

/// Concatenate all chunks of `session_id` into the completed artifact.
///
/// Precondition: the session's `assembly_state` is `in_progress` and this
/// task is the one that moved it there.
pub async fn run_assembly(
    store: &ChunkStore,
    registry: &SessionRegistry,
    config: &AppConfig,
    session_id: &SessionId,
) -> AssemblyRun {
    metrics::ASSEMBLIES_ACTIVE.inc();
    let started = Instant::now();
    let run = assemble_inner(store, registry, config, session_id).await;
    metrics::ASSEMBLIES_ACTIVE.dec();

    match &run {
        AssemblyRun::Completed => {
            metrics::ASSEMBLIES_COMPLETED.inc();
            metrics::ASSEMBLY_DURATION.observe(started.elapsed().as_secs_f64());
        }
        AssemblyRun::Failed => metrics::ASSEMBLIES_FAILED.inc(),
        AssemblyRun::Demoted => {}
    }
    run
}

async fn assemble_inner(
    store: &ChunkStore,
    registry: &SessionRegistry,
    config: &AppConfig,
    session_id: &SessionId,
) -> AssemblyRun {
    let Some(record) = registry.snapshot(session_id).await else {
        // Cancelled out from under us; nothing to write state into.
        warn!(session_id = %session_id, "Session vanished at assembly start");
        return AssemblyRun::Demoted;
    };

    let Some(total_chunks) = record.total_chunks else {
        return fail(registry, session_id, "session metadata incomplete").await;
    };
    let Some(file_name) = record.artifact_file_name() else {
        return fail(registry, session_id, "no artifact name known").await;
    };

    // Disk is authoritative: re-enumerate rather than trusting the record.
    let mut missing = Vec::new();
    for index in 0..total_chunks {
        match store.size_of(session_id, index).await {
            Ok(Some(_)) => {}
            Ok(None) => missing.push(index),
            Err(e) => {
                return fail(registry, session_id, &format!("chunk enumeration failed: {e}"))
                    .await;
            }
        }
    }
    if !missing.is_empty() {
        info!(
            session_id = %session_id,
            missing = missing.len(),
            "Chunks missing at assembly time, returning session to pending"
        );
        registry
            .update(session_id, |rec| {
                let _ = rec.transition(AssemblyState::Pending);
            })
            .await;
        return AssemblyRun::Demoted;
    }

    let mut upload = match store.begin_completed(session_id, &file_name).await {
        Ok(upload) => upload,
        Err(e) => {
            return fail(registry, session_id, &format!("artifact create failed: {e}")).await;
        }
    };

    for index in 0..total_chunks {
        let mut stream = match store
            .stream_chunk(session_id, index, config.assembly.buffer_bytes)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                upload.abort().await;
                return fail(registry, session_id, &format!("chunk {index} read failed: {e}"))
                    .await;
            }
        };
        while let Some(part) = stream.next().await {
            let part = match part {
                Ok(part) => part,
                Err(e) => {
                    upload.abort().await;
                    return fail(
                        registry,
                        session_id,
                        &format!("chunk {index} read failed: {e}"),
                    )
                    .await;
                }
            };
            if let Err(e) = upload.write(&part).await {
                upload.abort().await;
                return fail(registry, session_id, &format!("artifact write failed: {e}"))
                    .await;
            }
        }
    }

    let (artifact_path, total_bytes) = match upload.finish().await {
        Ok(done) => done,
        Err(e) => {
            return fail(registry, session_id, &format!("artifact publish failed: {e}")).await;
        }
    };

    let completed_at = OffsetDateTime::now_utc();
    let sidecar = ArtifactMeta {
        session_id: session_id.to_string(),
        file_name: file_name.clone(),
        total_chunks,
        total_bytes,
        format: record.format.clone(),
        created_at: record.created_at,
        completed_at,
        client_metadata: record.extra_metadata.clone(),
    };
    if let Err(e) = store.write_sidecar(session_id, &file_name, &sidecar).await {
        return fail(registry, session_id, &format!("sidecar write failed: {e}")).await;
    }

    if let Err(e) = store.delete_session_chunks(session_id).await {
        return fail(registry, session_id, &format!("chunk cleanup failed: {e}")).await;
    }

    registry
        .update(session_id, |rec| {
            let _ = rec.transition(AssemblyState::Done);
            rec.assembly_result = Some(AssemblyOutcome::Completed {
                artifact: artifact_path.clone(),
            });
            rec.completed_at = Some(completed_at);
        })
        .await;

    info!(
        session_id = %session_id,
        artifact = %artifact_path.display(),
        total_bytes,
        total_chunks,
        "Assembly complete"
    );
    AssemblyRun::Completed
}

/// Record a terminal failure. Chunks are preserved so retry is possible.
async fn fail(registry: &SessionRegistry, session_id: &SessionId, reason: &str) -> AssemblyRun {
    error!(session_id = %session_id, reason, "Assembly failed");
    registry
        .update(session_id, |rec| {
            let _ = rec.transition(AssemblyState::Failed);
            rec.assembly_result = Some(AssemblyOutcome::Failed {
                reason: reason.to_string(),
            });
        })
        .await;
    AssemblyRun::Failed
}
