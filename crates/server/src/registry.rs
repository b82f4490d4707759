//! In-memory session registry.
//!
//! The registry is the only mutable shared state in the process. Records are
//! individually guarded: the map lock is held just long enough to look up or
//! insert an entry, and the per-record lock is held only around pure state
//! mutations. Filesystem I/O never happens under either lock; handlers read
//! what they need, release, perform I/O, then re-lock to apply the result.
//!
//! Nothing here persists. After a restart the registry is rebuilt by
//! scanning the chunk store ([`SessionRegistry::hydrate`]); rebuilt records
//! are half-known until the client reasserts create-time metadata.

use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use waveforge_core::session::{AssemblyOutcome, AssemblyState, SessionId, SessionMeta};
use waveforge_core::{Result, SessionRecord};
use waveforge_storage::ChunkStore;

/// Process-wide map from session identifier to its guarded record.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionRecord>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create a record, verifying supplied metadata against any
    /// existing record. Returns a snapshot after the update.
    pub async fn get_or_create(
        &self,
        session_id: &SessionId,
        meta: &SessionMeta,
        now: OffsetDateTime,
    ) -> Result<SessionRecord> {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(session_id.clone())
                .or_insert_with(|| {
                    info!(session_id = %session_id, total_chunks = meta.total_chunks, "Created session record");
                    Arc::new(Mutex::new(SessionRecord::new(
                        session_id.clone(),
                        meta,
                        now,
                    )))
                })
                .clone()
        };

        let mut record = entry.lock().await;
        record.reassert_meta(meta)?;
        record.touch(now);
        Ok(record.clone())
    }

    /// Look up a record, creating a half-known one if absent.
    ///
    /// The fallback upload path carries no create-time metadata; sessions it
    /// starts stay half-known until a create-slot or completion request
    /// fills in the rest.
    pub async fn ensure_exists(
        &self,
        session_id: &SessionId,
        now: OffsetDateTime,
    ) -> Arc<Mutex<SessionRecord>> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                info!(session_id = %session_id, "Created half-known session record");
                Arc::new(Mutex::new(SessionRecord::rehydrated(
                    session_id.clone(),
                    Default::default(),
                    now,
                )))
            })
            .clone()
    }

    /// Insert a record rebuilt from disk, if none exists for the id.
    async fn insert_rehydrated(&self, record: SessionRecord) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(record.session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(record)));
    }

    /// Snapshot a record by id.
    pub async fn snapshot(&self, session_id: &SessionId) -> Option<SessionRecord> {
        let entry = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        };
        match entry {
            Some(entry) => Some(entry.lock().await.clone()),
            None => None,
        }
    }

    /// Apply a mutation to a record, serialized per session. The closure
    /// must not perform I/O; it sees the record under its lock.
    pub async fn update<T>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Option<T> {
        let entry = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).cloned()
        };
        match entry {
            Some(entry) => {
                let mut record = entry.lock().await;
                Some(f(&mut record))
            }
            None => None,
        }
    }

    /// Remove a record. Returns true if one existed.
    pub async fn delete(&self, session_id: &SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id).is_some()
    }

    /// Snapshot every record. The map lock is released before the per-record
    /// locks are taken.
    pub async fn iter_all(&self) -> Vec<SessionRecord> {
        let entries: Vec<_> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.lock().await.clone());
        }
        records
    }

    /// Number of live records.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Rebuild the registry from the chunk store after a restart.
    ///
    /// Chunk presence and sizes come from shard enumeration and are
    /// authoritative. A session with a completed artifact and no remaining
    /// chunks rehydrates straight to `done`; everything else comes back
    /// half-known and accepts only probe, status, and cancel until the
    /// client reasserts metadata.
    pub async fn hydrate(&self, store: &ChunkStore, now: OffsetDateTime) -> usize {
        let scans = match store.scan_sessions().await {
            Ok(scans) => scans,
            Err(e) => {
                warn!(error = %e, "Storage scan failed; starting with an empty registry");
                return 0;
            }
        };

        let mut restored = 0;
        for scan in scans {
            let session_id = match SessionId::parse(&scan.dir_name) {
                Ok(id) => id,
                Err(e) => {
                    warn!(dir = %scan.dir_name, error = %e, "Skipping non-session directory in storage root");
                    continue;
                }
            };

            let last_activity = scan.last_modified.unwrap_or(now);
            let mut record =
                SessionRecord::rehydrated(session_id.clone(), scan.chunks, last_activity);

            if let Some((file_name, _size)) = scan.completed.first() {
                record.artifact_name = Some(file_name.clone());
                record.completion_signalled = true;
                record.assembly_state = AssemblyState::Done;
                record.assembly_result = Some(AssemblyOutcome::Completed {
                    artifact: store.completed_path(&session_id, file_name),
                });
                record.completed_at = Some(last_activity);
            }

            info!(
                session_id = %session_id,
                chunks = record.chunks_persisted.len(),
                assembly_state = %record.assembly_state,
                "Rehydrated session from storage"
            );
            self.insert_rehydrated(record).await;
            restored += 1;
        }
        restored
    }
}
