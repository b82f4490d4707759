//! Session identifiers, the per-session record, and the assembly lifecycle.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;

/// Default alphabet for session identifiers: hex plus dashes and underscores,
/// widened to the full ASCII alphanumerics the browser client generates.
pub const DEFAULT_SESSION_ID_ALPHABET: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum accepted length of a session identifier.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// A validated, path-safe session identifier chosen by the client.
///
/// Validation happens before the identifier ever reaches the filesystem:
/// only characters from the configured alphabet are accepted, and path
/// separators are rejected unconditionally, whatever the alphabet says.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Parse and validate against the default alphabet.
    pub fn parse(s: &str) -> Result<Self> {
        Self::parse_with_alphabet(s, DEFAULT_SESSION_ID_ALPHABET)
    }

    /// Parse and validate against a configured alphabet.
    pub fn parse_with_alphabet(s: &str, alphabet: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidSessionId("empty identifier".to_string()));
        }
        if s.len() > MAX_SESSION_ID_LEN {
            return Err(Error::InvalidSessionId(format!(
                "identifier length {} exceeds maximum {}",
                s.len(),
                MAX_SESSION_ID_LEN
            )));
        }
        // Path separators and relative-path markers are rejected even if an
        // operator puts them in the alphabet.
        if s.contains(['/', '\\']) || s.starts_with('.') {
            return Err(Error::InvalidSessionId(format!(
                "identifier contains unsafe path characters: {s}"
            )));
        }
        if let Some(bad) = s.chars().find(|c| !alphabet.contains(*c)) {
            return Err(Error::InvalidSessionId(format!(
                "identifier contains disallowed character {bad:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Create-time metadata supplied by the client on the first protocol verb.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Number of fixed-position chunks in the final artifact.
    pub total_chunks: u32,
    /// Base name for the completed artifact.
    pub recording_name: String,
    /// Media-type suffix, e.g. "webm".
    pub format: String,
    /// Sum of announced chunk sizes, when the client knows it.
    pub expected_total_bytes: Option<u64>,
    /// Passthrough key/value pairs, stored verbatim and echoed into the
    /// sidecar metadata file at assembly time.
    pub extra: BTreeMap<String, String>,
}

impl SessionMeta {
    /// Validate create-time constraints.
    pub fn validate(&self) -> Result<()> {
        if self.total_chunks == 0 {
            return Err(Error::InvalidMetadata(
                "total_chunks must be at least 1".to_string(),
            ));
        }
        if self.recording_name.contains(['/', '\\']) || self.recording_name.starts_with('.') {
            return Err(Error::InvalidMetadata(format!(
                "recording name contains unsafe path characters: {}",
                self.recording_name
            )));
        }
        Ok(())
    }
}

/// Assembly lifecycle. Transitions are monotone along the order listed,
/// with the two exceptions called out on [`AssemblyState::can_transition`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyState {
    /// No completion signal received yet.
    #[default]
    None,
    /// Completion signalled; waiting for all chunks to be persisted.
    Pending,
    /// Exactly one assembly task is running.
    InProgress,
    /// Artifact published, chunk tree removed.
    Done,
    /// Assembly gave up; chunks are preserved for retry.
    Failed,
}

impl AssemblyState {
    /// Stable lowercase name for logs and wire responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Whether the state admits no further assembly work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Check a transition against the allowed paths.
    ///
    /// Forward moves follow the declared order. Two backward moves exist:
    /// `in_progress -> pending` (assembly aborted on missing chunks) and
    /// `failed -> pending` (client re-triggered assembly after a failure).
    pub fn can_transition(&self, to: AssemblyState) -> bool {
        use AssemblyState::*;
        matches!(
            (self, to),
            (None, Pending)
                | (Pending, InProgress)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (Pending, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for AssemblyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of an assembly run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AssemblyOutcome {
    /// Artifact published at the given path.
    Completed { artifact: PathBuf },
    /// Assembly failed; chunks were preserved.
    Failed { reason: String },
}

/// One recording's upload lifecycle.
///
/// Owned exclusively by the session registry; handlers see it only through
/// the registry's `update` and `snapshot` operations.
#[derive(Clone, Debug, Serialize)]
pub struct SessionRecord {
    /// Client-chosen identifier.
    pub session_id: SessionId,
    /// Number of chunks in the final artifact. `None` after a process
    /// restart until the client reasserts metadata; a half-known record
    /// accepts only probe, status, and cancel.
    pub total_chunks: Option<u32>,
    /// Sum of announced chunk sizes, if the client declared it.
    pub expected_total_bytes: Option<u64>,
    /// Indices whose chunk reached its announced size (or was flagged
    /// final). Grows monotonically.
    pub chunks_persisted: BTreeSet<u32>,
    /// Advisory byte counts per persisted chunk; disk is authoritative.
    pub chunk_sizes: BTreeMap<u32, u64>,
    /// Current accepted offset per chunk, tracking partial writes.
    pub chunk_offsets: BTreeMap<u32, u64>,
    /// Announced size per chunk, from the create-slot `Upload-Length`.
    pub announced_sizes: BTreeMap<u32, u64>,
    /// Base name for the completed artifact, from create-time metadata.
    pub recording_name: Option<String>,
    /// Media-type suffix, from create-time metadata.
    pub format: Option<String>,
    /// Artifact file name asserted by the completion signal. Wins over
    /// `{recording_name}.{format}` when present.
    pub artifact_name: Option<String>,
    /// Passthrough metadata, echoed into the sidecar at assembly time.
    pub extra_metadata: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Updated on every accepted operation; drives the sweeper TTL.
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
    /// Set once when the client asserts all chunks are queued.
    pub completion_signalled: bool,
    pub assembly_state: AssemblyState,
    /// Present iff `assembly_state` is `done` or `failed`.
    pub assembly_result: Option<AssemblyOutcome>,
    /// When assembly finished; drives the completed-artifact retention TTL.
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl SessionRecord {
    /// Create a fresh record from create-time metadata.
    pub fn new(session_id: SessionId, meta: &SessionMeta, now: OffsetDateTime) -> Self {
        Self {
            session_id,
            total_chunks: Some(meta.total_chunks),
            expected_total_bytes: meta.expected_total_bytes,
            chunks_persisted: BTreeSet::new(),
            chunk_sizes: BTreeMap::new(),
            chunk_offsets: BTreeMap::new(),
            announced_sizes: BTreeMap::new(),
            recording_name: Some(meta.recording_name.clone()),
            format: Some(meta.format.clone()),
            artifact_name: None,
            extra_metadata: meta.extra.clone(),
            created_at: now,
            last_activity_at: now,
            completion_signalled: false,
            assembly_state: AssemblyState::None,
            assembly_result: None,
            completed_at: None,
        }
    }

    /// Create a half-known record rebuilt from an on-disk chunk scan.
    ///
    /// `chunks` maps chunk index to on-disk size; disk sizes are
    /// authoritative so every scanned chunk counts as persisted.
    pub fn rehydrated(
        session_id: SessionId,
        chunks: BTreeMap<u32, u64>,
        last_activity_at: OffsetDateTime,
    ) -> Self {
        let persisted: BTreeSet<u32> = chunks.keys().copied().collect();
        Self {
            session_id,
            total_chunks: None,
            expected_total_bytes: None,
            chunks_persisted: persisted,
            chunk_offsets: chunks.clone(),
            chunk_sizes: chunks,
            announced_sizes: BTreeMap::new(),
            recording_name: None,
            format: None,
            artifact_name: None,
            extra_metadata: BTreeMap::new(),
            created_at: last_activity_at,
            last_activity_at,
            completion_signalled: false,
            assembly_state: AssemblyState::None,
            assembly_result: None,
            completed_at: None,
        }
    }

    /// Whether this record is missing create-time metadata (post-restart).
    pub fn is_half_known(&self) -> bool {
        self.total_chunks.is_none()
    }

    /// Re-supply create-time metadata after a restart, or verify it against
    /// the existing record. Immutable fields must match once set; a
    /// contradiction is a `MetadataConflict`.
    pub fn reassert_meta(&mut self, meta: &SessionMeta) -> Result<()> {
        if let Some(total) = self.total_chunks {
            if total != meta.total_chunks {
                return Err(Error::MetadataConflict(format!(
                    "total_chunks mismatch: session has {total}, request says {}",
                    meta.total_chunks
                )));
            }
        } else {
            // Half-known record: the scan may have seen more chunks than the
            // client now claims, which is a contradiction too.
            if let Some(max) = self.chunks_persisted.iter().next_back() {
                if *max >= meta.total_chunks {
                    return Err(Error::MetadataConflict(format!(
                        "total_chunks {} contradicts persisted chunk index {max}",
                        meta.total_chunks
                    )));
                }
            }
            self.total_chunks = Some(meta.total_chunks);
        }

        match &self.recording_name {
            Some(name) if name != &meta.recording_name => {
                return Err(Error::MetadataConflict(format!(
                    "recording_name mismatch: session has {name:?}, request says {:?}",
                    meta.recording_name
                )));
            }
            Some(_) => {}
            None => self.recording_name = Some(meta.recording_name.clone()),
        }

        match &self.format {
            Some(format) if format != &meta.format => {
                return Err(Error::MetadataConflict(format!(
                    "format mismatch: session has {format:?}, request says {:?}",
                    meta.format
                )));
            }
            Some(_) => {}
            None => self.format = Some(meta.format.clone()),
        }

        if self.expected_total_bytes.is_none() {
            self.expected_total_bytes = meta.expected_total_bytes;
        }
        for (key, value) in &meta.extra {
            self.extra_metadata
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        Ok(())
    }

    /// Validate a chunk index against `total_chunks`.
    pub fn check_chunk_index(&self, index: u32) -> Result<()> {
        match self.total_chunks {
            Some(total) if index < total => Ok(()),
            Some(total) => Err(Error::InvalidChunkIndex { index, total }),
            None => Ok(()),
        }
    }

    /// Record an accepted append. Marks the chunk persisted when it reaches
    /// its announced size or the client flagged it final.
    pub fn record_append(&mut self, index: u32, new_offset: u64, client_final: bool) {
        self.chunk_offsets.insert(index, new_offset);
        let announced_reached = self
            .announced_sizes
            .get(&index)
            .is_some_and(|announced| new_offset >= *announced);
        if client_final || announced_reached {
            self.mark_chunk_persisted(index, new_offset);
        }
    }

    /// Mark a chunk as fully persisted with its on-disk size.
    pub fn mark_chunk_persisted(&mut self, index: u32, size: u64) {
        self.chunks_persisted.insert(index);
        self.chunk_sizes.insert(index, size);
        self.chunk_offsets.insert(index, size);
    }

    /// Whether every chunk in `[0, total_chunks)` is persisted.
    /// Always false while the record is half-known.
    pub fn all_chunks_persisted(&self) -> bool {
        match self.total_chunks {
            Some(total) => (0..total).all(|i| self.chunks_persisted.contains(&i)),
            None => false,
        }
    }

    /// Chunk indices not yet persisted, in order.
    pub fn missing_indices(&self) -> Vec<u32> {
        match self.total_chunks {
            Some(total) => (0..total)
                .filter(|i| !self.chunks_persisted.contains(i))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Sum of persisted chunk sizes.
    pub fn persisted_bytes(&self) -> u64 {
        self.chunk_sizes.values().sum()
    }

    /// Artifact file name: the completion signal's name when present,
    /// otherwise `{recording_name}.{format}`.
    pub fn artifact_file_name(&self) -> Option<String> {
        if let Some(name) = &self.artifact_name {
            return Some(name.clone());
        }
        match (&self.recording_name, &self.format) {
            (Some(name), Some(format)) => Some(format!("{name}.{format}")),
            _ => None,
        }
    }

    /// Attempt a lifecycle transition, enforcing the allowed paths.
    pub fn transition(&mut self, to: AssemblyState) -> Result<()> {
        if !self.assembly_state.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: self.assembly_state.as_str(),
                to: to.as_str(),
            });
        }
        self.assembly_state = to;
        Ok(())
    }

    /// Bump the activity timestamp.
    pub fn touch(&mut self, now: OffsetDateTime) {
        self.last_activity_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn meta(total: u32) -> SessionMeta {
        SessionMeta {
            total_chunks: total,
            recording_name: "take-1".to_string(),
            format: "webm".to_string(),
            expected_total_bytes: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn session_id_accepts_conservative_alphabet() {
        SessionId::parse("rec-2024_0042-abcdef").unwrap();
        SessionId::parse("ABCDEF0123456789").unwrap();
    }

    #[test]
    fn session_id_rejects_path_characters() {
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("../escape").is_err());
        assert!(SessionId::parse("a/b").is_err());
        assert!(SessionId::parse("a\\b").is_err());
        assert!(SessionId::parse(".hidden").is_err());
        assert!(SessionId::parse("with space").is_err());
        assert!(SessionId::parse(&"x".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }

    #[test]
    fn session_id_honors_custom_alphabet() {
        assert!(SessionId::parse_with_alphabet("abc", "abc").is_ok());
        assert!(SessionId::parse_with_alphabet("abd", "abc").is_err());
        // Separators stay rejected even when the alphabet lists them.
        assert!(SessionId::parse_with_alphabet("a/b", "ab/").is_err());
    }

    #[test]
    fn meta_rejects_zero_chunks_and_unsafe_names() {
        assert!(meta(0).validate().is_err());
        let mut m = meta(1);
        m.recording_name = "../../etc/passwd".to_string();
        assert!(m.validate().is_err());
        assert!(meta(3).validate().is_ok());
    }

    #[test]
    fn assembly_transitions_are_monotone() {
        use AssemblyState::*;
        assert!(None.can_transition(Pending));
        assert!(Pending.can_transition(InProgress));
        assert!(InProgress.can_transition(Done));
        assert!(InProgress.can_transition(Failed));
        assert!(InProgress.can_transition(Pending));
        assert!(Failed.can_transition(Pending));

        assert!(!Done.can_transition(Pending));
        assert!(!Done.can_transition(InProgress));
        assert!(!None.can_transition(InProgress));
        assert!(!Pending.can_transition(Done));
    }

    #[test]
    fn record_append_persists_on_announced_size() {
        let now = datetime!(2024-06-01 12:00 UTC);
        let mut rec = SessionRecord::new(SessionId::parse("s1").unwrap(), &meta(2), now);
        rec.announced_sizes.insert(0, 100);

        rec.record_append(0, 60, false);
        assert!(!rec.chunks_persisted.contains(&0));
        assert_eq!(rec.chunk_offsets[&0], 60);

        rec.record_append(0, 100, false);
        assert!(rec.chunks_persisted.contains(&0));
        assert_eq!(rec.chunk_sizes[&0], 100);
    }

    #[test]
    fn record_append_persists_on_client_final_flag() {
        let now = datetime!(2024-06-01 12:00 UTC);
        let mut rec = SessionRecord::new(SessionId::parse("s1").unwrap(), &meta(1), now);
        rec.record_append(0, 42, true);
        assert!(rec.chunks_persisted.contains(&0));
        assert!(rec.all_chunks_persisted());
    }

    #[test]
    fn missing_indices_reports_gaps() {
        let now = datetime!(2024-06-01 12:00 UTC);
        let mut rec = SessionRecord::new(SessionId::parse("s1").unwrap(), &meta(4), now);
        rec.mark_chunk_persisted(1, 10);
        rec.mark_chunk_persisted(3, 10);
        assert_eq!(rec.missing_indices(), vec![0, 2]);
        assert!(!rec.all_chunks_persisted());
    }

    #[test]
    fn reassert_meta_detects_conflicts() {
        let now = datetime!(2024-06-01 12:00 UTC);
        let mut rec = SessionRecord::new(SessionId::parse("s1").unwrap(), &meta(3), now);

        assert!(rec.reassert_meta(&meta(3)).is_ok());

        let mut wrong = meta(4);
        assert!(rec.reassert_meta(&wrong).is_err());
        wrong = meta(3);
        wrong.recording_name = "other".to_string();
        assert!(rec.reassert_meta(&wrong).is_err());
    }

    #[test]
    fn rehydrated_record_is_half_known_until_reasserted() {
        let now = datetime!(2024-06-01 12:00 UTC);
        let chunks: BTreeMap<u32, u64> = [(0, 10), (1, 20)].into_iter().collect();
        let mut rec = SessionRecord::rehydrated(SessionId::parse("s1").unwrap(), chunks, now);

        assert!(rec.is_half_known());
        assert!(!rec.all_chunks_persisted());
        assert_eq!(rec.persisted_bytes(), 30);

        // A total below an already-persisted index is a contradiction.
        assert!(rec.reassert_meta(&meta(1)).is_err());
        assert!(rec.reassert_meta(&meta(2)).is_ok());
        assert!(!rec.is_half_known());
        assert!(rec.all_chunks_persisted());
    }

    #[test]
    fn artifact_name_prefers_completion_file_name() {
        let now = datetime!(2024-06-01 12:00 UTC);
        let mut rec = SessionRecord::new(SessionId::parse("s1").unwrap(), &meta(1), now);
        assert_eq!(rec.artifact_file_name().as_deref(), Some("take-1.webm"));
        rec.artifact_name = Some("demo.webm".to_string());
        assert_eq!(rec.artifact_file_name().as_deref(), Some("demo.webm"));
    }
}
