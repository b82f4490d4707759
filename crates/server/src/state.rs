//! Application state shared across handlers and background tasks.

use crate::coordinator::CompletionCoordinator;
use crate::registry::SessionRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use waveforge_core::session::{AssemblyOutcome, AssemblyState, SessionId};
use waveforge_core::AppConfig;
use waveforge_storage::ChunkStore;

/// Registry for in-flight completion/assembly tasks.
///
/// The `assembly_state` CAS is the correctness gate against double
/// assembly; this registry exists for two softer jobs: detecting a
/// panicked task (which would otherwise leave its session wedged in
/// `in_progress` until restart) and draining in-flight work on shutdown.
pub struct AssemblyTaskRegistry {
    tasks: Mutex<HashMap<SessionId, JoinHandle<()>>>,
    registry: Arc<SessionRegistry>,
}

impl AssemblyTaskRegistry {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// Spawn and track a task for a session unless one is already live.
    /// Returns false if a live task exists.
    pub async fn spawn_for<F>(&self, session_id: SessionId, fut: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if let Some(existing) = tasks.get(&session_id) {
            if !existing.is_finished() {
                return false;
            }
        }
        tasks.insert(session_id, tokio::spawn(fut));
        true
    }

    /// Spawn a watchdog that periodically reaps finished tasks and demotes
    /// sessions whose task panicked. The caller keeps the handle.
    pub fn spawn_watchdog(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                self.check_tasks().await;
            }
        })
    }

    async fn check_tasks(&self) {
        let mut finished = Vec::new();

        // Hold the lock only while collecting finished handles.
        {
            let mut tasks = self.tasks.lock().await;
            let done_ids: Vec<SessionId> = tasks
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            for id in done_ids {
                if let Some(handle) = tasks.remove(&id) {
                    finished.push((id, handle));
                }
            }
        }

        for (session_id, handle) in finished {
            match handle.await {
                Err(join_err) if join_err.is_panic() => {
                    tracing::error!(
                        session_id = %session_id,
                        panic = ?join_err,
                        "Assembly task panicked, demoting session"
                    );
                    self.demote_wedged(&session_id).await;
                }
                Err(join_err) if join_err.is_cancelled() => {
                    tracing::warn!(session_id = %session_id, "Assembly task was cancelled");
                    self.demote_wedged(&session_id).await;
                }
                Ok(()) => {
                    tracing::debug!(session_id = %session_id, "Assembly task completed");
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = ?e, "Assembly task failed to join");
                    self.demote_wedged(&session_id).await;
                }
            }
        }
    }

    /// Force a session whose task died mid-flight into a terminal state so
    /// clients see `failed` instead of a forever-`in_progress` session.
    async fn demote_wedged(&self, session_id: &SessionId) {
        let demoted = self
            .registry
            .update(session_id, |record| {
                if record.assembly_state == AssemblyState::InProgress {
                    record.assembly_state = AssemblyState::Failed;
                    record.assembly_result = Some(AssemblyOutcome::Failed {
                        reason: "assembly task died mid-flight".to_string(),
                    });
                    crate::metrics::ASSEMBLIES_ACTIVE.dec();
                    crate::metrics::ASSEMBLIES_FAILED.inc();
                    true
                } else {
                    false
                }
            })
            .await
            .unwrap_or(false);
        if demoted {
            tracing::warn!(session_id = %session_id, "Session demoted to failed after task death");
        }
    }

    /// Wait for every tracked task to finish. Used on shutdown so an
    /// in-flight assembly can complete; new work is refused by then.
    pub async fn drain(&self) {
        let handles: Vec<(SessionId, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().collect()
        };
        for (session_id, handle) in handles {
            if let Err(e) = handle.await {
                tracing::warn!(session_id = %session_id, error = ?e, "Task ended abnormally during drain");
            }
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Chunk storage, sole owner of the storage root.
    pub store: Arc<ChunkStore>,
    /// In-memory session registry.
    pub registry: Arc<SessionRegistry>,
    /// Completion coordinator.
    pub coordinator: Arc<CompletionCoordinator>,
    /// Receives `true` when the server is shutting down.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<ChunkStore>,
        registry: Arc<SessionRegistry>,
        coordinator: Arc<CompletionCoordinator>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            coordinator,
            shutdown,
        }
    }
}
