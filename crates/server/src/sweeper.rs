//! Periodic reclamation of abandoned sessions and expired artifacts.

use crate::metrics;
use crate::registry::SessionRegistry;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use waveforge_core::session::AssemblyState;
use waveforge_core::AppConfig;
use waveforge_storage::ChunkStore;

/// Spawn the sweeper loop. It never touches a session whose assembly is
/// `in_progress`, and exits when the shutdown signal flips.
pub fn spawn_sweeper(
    config: Arc<AppConfig>,
    store: Arc<ChunkStore>,
    registry: Arc<SessionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.sessions.sweep_interval());
        // The immediate first tick would race startup rehydration.
        ticker.tick().await;
        info!(
            interval_secs = config.sessions.sweep_interval_secs,
            "Sweeper started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = sweep_once(&config, &store, &registry, OffsetDateTime::now_utc()).await;
                    if swept > 0 {
                        info!(swept, "Sweep pass reclaimed sessions");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sweeper exiting on shutdown");
                        return;
                    }
                }
            }
        }
    })
}

/// One sweep pass. Returns the number of sessions deleted.
///
/// A session goes when either its activity TTL elapsed while not assembling,
/// or it is `done` and the completed-artifact retention elapsed.
pub async fn sweep_once(
    config: &AppConfig,
    store: &ChunkStore,
    registry: &SessionRegistry,
    now: OffsetDateTime,
) -> usize {
    let ttl_active = config.sessions.ttl_active();
    let ttl_completed = config.sessions.ttl_completed();
    let mut swept = 0;

    for record in registry.iter_all().await {
        if record.assembly_state == AssemblyState::InProgress {
            continue;
        }

        let expired_active = now - record.last_activity_at > ttl_active;
        let expired_completed = record.assembly_state == AssemblyState::Done
            && record
                .completed_at
                .is_some_and(|completed| now - completed > ttl_completed);

        if !(expired_active || expired_completed) {
            continue;
        }

        let session_id = record.session_id.clone();
        // Re-check under the record lock: an append or an assembly start may
        // have landed since the snapshot.
        let still_expired = registry
            .update(&session_id, |rec| {
                rec.assembly_state != AssemblyState::InProgress
                    && (now - rec.last_activity_at > ttl_active
                        || (rec.assembly_state == AssemblyState::Done
                            && rec
                                .completed_at
                                .is_some_and(|completed| now - completed > ttl_completed)))
            })
            .await
            .unwrap_or(false);
        if !still_expired {
            continue;
        }

        info!(
            session_id = %session_id,
            assembly_state = %record.assembly_state,
            last_activity = %record.last_activity_at,
            "Sweeping expired session"
        );
        registry.delete(&session_id).await;
        if let Err(e) = store.delete_session(&session_id).await {
            warn!(session_id = %session_id, error = %e, "Failed to delete session storage");
        }
        metrics::SESSIONS_SWEPT.inc();
        swept += 1;
    }

    metrics::SESSIONS_ACTIVE.set(registry.len().await as i64);
    swept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use waveforge_core::session::{SessionId, SessionMeta};

    fn sid(s: &str) -> SessionId {
        SessionId::parse(s).unwrap()
    }

    fn meta() -> SessionMeta {
        SessionMeta {
            total_chunks: 1,
            recording_name: "demo".to_string(),
            format: "webm".to_string(),
            expected_total_bytes: None,
            extra: BTreeMap::new(),
        }
    }

    async fn fixture() -> (tempfile::TempDir, AppConfig, Arc<ChunkStore>, Arc<SessionRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::new(dir.path()).await.unwrap());
        let registry = Arc::new(SessionRegistry::new());
        (dir, AppConfig::for_testing(), store, registry)
    }

    #[tokio::test]
    async fn sweeps_inactive_sessions_and_their_storage() {
        let (_dir, config, store, registry) = fixture().await;
        let id = sid("stale");
        let long_ago = OffsetDateTime::now_utc() - time::Duration::hours(48);
        registry.get_or_create(&id, &meta(), long_ago).await.unwrap();
        store.append_at(&id, 0, 0, b"bytes").await.unwrap();

        let swept = sweep_once(&config, &store, &registry, OffsetDateTime::now_utc()).await;
        assert_eq!(swept, 1);
        assert!(registry.snapshot(&id).await.is_none());
        assert!(store.list_session(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keeps_sessions_within_ttl() {
        let (_dir, config, store, registry) = fixture().await;
        let id = sid("fresh");
        let now = OffsetDateTime::now_utc();
        registry.get_or_create(&id, &meta(), now).await.unwrap();

        let swept = sweep_once(&config, &store, &registry, now).await;
        assert_eq!(swept, 0);
        assert!(registry.snapshot(&id).await.is_some());
    }

    #[tokio::test]
    async fn never_touches_in_progress_sessions() {
        let (_dir, config, store, registry) = fixture().await;
        let id = sid("busy");
        let long_ago = OffsetDateTime::now_utc() - time::Duration::hours(48);
        registry.get_or_create(&id, &meta(), long_ago).await.unwrap();
        registry
            .update(&id, |rec| {
                rec.transition(AssemblyState::Pending).unwrap();
                rec.transition(AssemblyState::InProgress).unwrap();
            })
            .await;

        let swept = sweep_once(&config, &store, &registry, OffsetDateTime::now_utc()).await;
        assert_eq!(swept, 0);
        assert!(registry.snapshot(&id).await.is_some());
    }

    #[tokio::test]
    async fn reclaims_done_sessions_past_retention() {
        let (_dir, config, store, registry) = fixture().await;
        let id = sid("kept");
        let now = OffsetDateTime::now_utc();
        registry.get_or_create(&id, &meta(), now).await.unwrap();
        let upload = store.begin_completed(&id, "demo.webm").await.unwrap();
        upload.finish().await.unwrap();
        registry
            .update(&id, |rec| {
                rec.transition(AssemblyState::Pending).unwrap();
                rec.transition(AssemblyState::InProgress).unwrap();
                rec.transition(AssemblyState::Done).unwrap();
                rec.completed_at = Some(now - time::Duration::hours(2));
                // Activity is recent; only the retention clock has elapsed.
                rec.touch(now);
            })
            .await;

        let swept = sweep_once(&config, &store, &registry, now).await;
        assert_eq!(swept, 1);
        assert!(registry.snapshot(&id).await.is_none());
        assert!(store.open_completed(&id, "demo.webm").await.is_err());
    }
}
