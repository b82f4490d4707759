//! Completion coordinator.
//!
//! The completion signal commonly arrives before every chunk has traversed
//! the client's retry queue. The coordinator absorbs that race: it marks the
//! session `pending`, then waits with backoff until all chunks are actually
//! persisted before handing the session to the assembler — exactly once,
//! gated by the `pending -> in_progress` CAS.

use crate::assembler::{AssemblyRun, run_assembly};
use crate::registry::SessionRegistry;
use crate::state::AssemblyTaskRegistry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, info, warn};
use waveforge_core::session::{AssemblyOutcome, AssemblyState, SessionId};
use waveforge_core::AppConfig;
use waveforge_storage::ChunkStore;

type WakeupMap = Arc<Mutex<HashMap<SessionId, Arc<Notify>>>>;

/// Coordinates completion signals with actual chunk persistence.
pub struct CompletionCoordinator {
    config: Arc<AppConfig>,
    store: Arc<ChunkStore>,
    registry: Arc<SessionRegistry>,
    tasks: Arc<AssemblyTaskRegistry>,
    /// Per-session wakeups: appends nudge an in-flight waiter so the last
    /// chunk does not have to sit out a whole backoff interval.
    wakeups: WakeupMap,
    shutdown: watch::Receiver<bool>,
}

impl CompletionCoordinator {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<ChunkStore>,
        registry: Arc<SessionRegistry>,
        tasks: Arc<AssemblyTaskRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            tasks,
            wakeups: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    /// Apply a completion signal (or a manual assemble trigger) to a
    /// session and ensure a waiter task is running for it. Idempotent.
    ///
    /// Returns the assembly state after the transition, or `None` if the
    /// session does not exist.
    pub async fn signal(
        &self,
        session_id: &SessionId,
        file_name: Option<String>,
        extra_metadata: BTreeMap<String, String>,
        now: OffsetDateTime,
    ) -> Option<AssemblyState> {
        let state = self
            .registry
            .update(session_id, |record| {
                record.completion_signalled = true;
                record.touch(now);
                if let Some(name) = &file_name {
                    record.artifact_name = Some(name.clone());
                }
                for (key, value) in &extra_metadata {
                    record
                        .extra_metadata
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                match record.assembly_state {
                    AssemblyState::None | AssemblyState::Failed => {
                        let _ = record.transition(AssemblyState::Pending);
                    }
                    AssemblyState::Pending
                    | AssemblyState::InProgress
                    | AssemblyState::Done => {}
                }
                record.assembly_state
            })
            .await?;

        if state == AssemblyState::Pending {
            self.ensure_waiter(session_id.clone()).await;
        }
        Some(state)
    }

    /// Wake the session's waiter, if any. Called after an accepted append
    /// so the final chunk triggers assembly without waiting out a backoff.
    pub async fn nudge(&self, session_id: &SessionId) {
        let wakeup = {
            let wakeups = self.wakeups.lock().await;
            wakeups.get(session_id).cloned()
        };
        if let Some(wakeup) = wakeup {
            wakeup.notify_one();
        }
    }

    async fn ensure_waiter(&self, session_id: SessionId) {
        if *self.shutdown.borrow() {
            warn!(session_id = %session_id, "Shutting down, not starting assembly waiter");
            return;
        }

        let wakeup = {
            let mut wakeups = self.wakeups.lock().await;
            wakeups
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone()
        };

        let ctx = WaiterCtx {
            config: self.config.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            wakeups: self.wakeups.clone(),
            shutdown: self.shutdown.clone(),
        };
        let task_session = session_id.clone();
        let spawned = self
            .tasks
            .spawn_for(session_id.clone(), async move {
                waiter_loop(ctx, task_session, wakeup).await;
            })
            .await;
        if spawned {
            debug!(session_id = %session_id, "Assembly waiter started");
        }
    }
}

/// Everything a waiter task owns.
struct WaiterCtx {
    config: Arc<AppConfig>,
    store: Arc<ChunkStore>,
    registry: Arc<SessionRegistry>,
    wakeups: WakeupMap,
    shutdown: watch::Receiver<bool>,
}

/// Retry loop for one signalled session. Ends in `done`, `failed`, or on
/// cancel/shutdown; a `MissingChunks` demotion keeps the loop alive.
async fn waiter_loop(mut ctx: WaiterCtx, session_id: SessionId, wakeup: Arc<Notify>) {
    let mut backoff = ctx.config.assembly.retry_initial();
    let retry_max = ctx.config.assembly.retry_max();
    let ttl_active = ctx.config.sessions.ttl_active();

    loop {
        if *ctx.shutdown.borrow() {
            debug!(session_id = %session_id, "Waiter exiting on shutdown");
            break;
        }

        let Some(record) = ctx.registry.snapshot(&session_id).await else {
            debug!(session_id = %session_id, "Waiter exiting, session removed");
            break;
        };

        match record.assembly_state {
            AssemblyState::Pending => {}
            AssemblyState::Done | AssemblyState::Failed => break,
            // Any other combination means someone else owns the session's
            // fate; this waiter is done.
            AssemblyState::InProgress | AssemblyState::None => break,
        }

        if record.all_chunks_persisted() {
            let began = ctx
                .registry
                .update(&session_id, |rec| {
                    rec.transition(AssemblyState::InProgress).is_ok()
                })
                .await
                .unwrap_or(false);
            if !began {
                // Lost the CAS; whoever won owns the terminal state.
                break;
            }
            info!(session_id = %session_id, "All chunks persisted, assembling");
            match run_assembly(&ctx.store, &ctx.registry, &ctx.config, &session_id).await {
                AssemblyRun::Completed | AssemblyRun::Failed => break,
                AssemblyRun::Demoted => {
                    // Registry said complete but disk disagreed; keep
                    // waiting for the missing bytes.
                    backoff = ctx.config.assembly.retry_initial();
                }
            }
        } else {
            let now = OffsetDateTime::now_utc();
            if now - record.last_activity_at > ttl_active {
                warn!(
                    session_id = %session_id,
                    missing = record.missing_indices().len(),
                    "Completion retry window elapsed, failing session"
                );
                ctx.registry
                    .update(&session_id, |rec| {
                        let _ = rec.transition(AssemblyState::Failed);
                        rec.assembly_result = Some(AssemblyOutcome::Failed {
                            reason: "timed out waiting for missing chunks".to_string(),
                        });
                    })
                    .await;
                crate::metrics::ASSEMBLIES_FAILED.inc();
                break;
            }
            debug!(
                session_id = %session_id,
                missing = record.missing_indices().len(),
                backoff_secs = backoff.as_secs(),
                "Chunks still missing, retrying"
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = wakeup.notified() => {
                debug!(session_id = %session_id, "Waiter nudged");
            }
            _ = ctx.shutdown.changed() => {}
        }
        backoff = (backoff * 2).min(retry_max);
    }

    let mut wakeups = ctx.wakeups.lock().await;
    wakeups.remove(&session_id);
}
