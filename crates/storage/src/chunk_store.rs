//! Sharded on-disk chunk storage.
//!
//! Owns the directory layout under the storage root:
//!
//! ```text
//! {root}/{session_id}/
//!   chunks/
//!     shard_{NNNN}/
//!       {chunk_index}
//!   completed/
//!     {file_name}
//!     {file_name}.meta
//! ```
//!
//! Chunk index `i` lives in `shard_{i / 1000:04}`, keeping any one directory
//! under ~1000 entries. No other component writes under the root.

use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use futures::Stream;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;
use waveforge_core::session::SessionId;
use waveforge_core::{ArtifactMeta, CHUNKS_PER_SHARD};

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Byte stream returned by range reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// One session directory found by a root scan.
#[derive(Debug)]
pub struct SessionScan {
    /// Raw directory name; the caller validates it as a session id.
    pub dir_name: String,
    /// Chunk index to on-disk size, from shard enumeration.
    pub chunks: BTreeMap<u32, u64>,
    /// Completed artifacts (file name, size), sidecars excluded.
    pub completed: Vec<(String, u64)>,
    /// Most recent modification time seen in the session directory.
    pub last_modified: Option<OffsetDateTime>,
}

/// The chunk store. Cheap to clone via `Arc` in the server state.
pub struct ChunkStore {
    root: PathBuf,
    /// Per-chunk append locks. `append_at`'s size-check-then-write must be
    /// atomic within the process so that of two racing appends exactly one
    /// succeeds and the other observes the new size.
    append_locks: Mutex<HashMap<(SessionId, u32), Arc<Mutex<()>>>>,
}

impl ChunkStore {
    /// Open (and create if needed) a chunk store rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(StorageError::from_io)?;
        Ok(Self {
            root,
            append_locks: Mutex::new(HashMap::new()),
        })
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.root.join(session.as_str())
    }

    fn chunks_dir(&self, session: &SessionId) -> PathBuf {
        self.session_dir(session).join("chunks")
    }

    fn shard_dir(&self, session: &SessionId, index: u32) -> PathBuf {
        let shard = index / CHUNKS_PER_SHARD;
        self.chunks_dir(session).join(format!("shard_{shard:04}"))
    }

    /// Absolute path of a chunk file.
    pub fn chunk_path(&self, session: &SessionId, index: u32) -> PathBuf {
        self.shard_dir(session, index).join(index.to_string())
    }

    /// Root-relative chunk location, for diagnostics.
    pub fn chunk_path_hint(&self, session: &SessionId, index: u32) -> String {
        let shard = index / CHUNKS_PER_SHARD;
        format!("{}/chunks/shard_{shard:04}/{index}", session.as_str())
    }

    fn completed_dir(&self, session: &SessionId) -> PathBuf {
        self.session_dir(session).join("completed")
    }

    /// Absolute path of a completed artifact.
    pub fn completed_path(&self, session: &SessionId, file_name: &str) -> PathBuf {
        self.completed_dir(session).join(file_name)
    }

    async fn chunk_lock(&self, session: &SessionId, index: u32) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock().await;
        locks
            .entry((session.clone(), index))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn drop_session_locks(&self, session: &SessionId) {
        let mut locks = self.append_locks.lock().await;
        locks.retain(|(sid, _), _| sid != session);
    }

    /// Create the shard directory for a chunk and return its path.
    /// Idempotent.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn ensure_chunk_slot(
        &self,
        session: &SessionId,
        index: u32,
    ) -> StorageResult<PathBuf> {
        let shard = self.shard_dir(session, index);
        fs::create_dir_all(&shard)
            .await
            .map_err(StorageError::from_io)?;
        Ok(shard.join(index.to_string()))
    }

    /// Append `data` to a chunk at `offset`.
    ///
    /// The on-disk size must equal `offset` exactly; anything else is an
    /// `OffsetMismatch` carrying the actual size, which is the contract that
    /// drives probe-before-retry. Data is fsynced before the new size is
    /// returned, so a returned offset is a durability promise.
    #[instrument(skip(self, data), fields(session = %session, size = data.len()))]
    pub async fn append_at(
        &self,
        session: &SessionId,
        index: u32,
        offset: u64,
        data: &[u8],
    ) -> StorageResult<u64> {
        let lock = self.chunk_lock(session, index).await;
        let _guard = lock.lock().await;

        let path = self.ensure_chunk_slot(session, index).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(false)
            .open(&path)
            .await
            .map_err(StorageError::from_io)?;

        let actual = file
            .metadata()
            .await
            .map_err(StorageError::from_io)?
            .len();
        if actual != offset {
            return Err(StorageError::OffsetMismatch {
                declared: offset,
                actual,
            });
        }

        file.write_all(data).await.map_err(StorageError::from_io)?;
        file.sync_data().await.map_err(StorageError::from_io)?;

        Ok(actual + data.len() as u64)
    }

    /// Replace a chunk wholesale, writing `data` as its full contents.
    ///
    /// Used by the one-shot fallback upload: the bytes land in a temp file,
    /// are fsynced, then atomically renamed over any partial prior attempt.
    #[instrument(skip(self, data), fields(session = %session, size = data.len()))]
    pub async fn write_whole_chunk(
        &self,
        session: &SessionId,
        index: u32,
        data: &[u8],
    ) -> StorageResult<u64> {
        let lock = self.chunk_lock(session, index).await;
        let _guard = lock.lock().await;

        let path = self.ensure_chunk_slot(session, index).await?;
        let temp_path = path.with_file_name(format!(".{index}.tmp.{}", Uuid::new_v4()));
        {
            let mut file = fs::File::create(&temp_path)
                .await
                .map_err(StorageError::from_io)?;
            if let Err(e) = file.write_all(data).await {
                drop(file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(StorageError::from_io(e));
            }
            if let Err(e) = file.sync_all().await {
                drop(file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(StorageError::from_io(e));
            }
        }
        fs::rename(&temp_path, &path)
            .await
            .map_err(StorageError::from_io)?;
        Ok(data.len() as u64)
    }

    /// On-disk size of a chunk, or `None` if it has not been started.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn size_of(&self, session: &SessionId, index: u32) -> StorageResult<Option<u64>> {
        let path = self.chunk_path(session, index);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Stream the byte range `[start, end)` of a chunk.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn stream_range(
        &self,
        session: &SessionId,
        index: u32,
        start: u64,
        end: u64,
    ) -> StorageResult<ByteStream> {
        if end < start {
            return Err(StorageError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }

        let path = self.chunk_path(session, index);
        let mut file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(self.chunk_path_hint(session, index))
            } else {
                StorageError::Io(e)
            }
        })?;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(StorageError::Io)?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut remaining = end - start;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            while remaining > 0 {
                let want = remaining.min(STREAM_CHUNK_SIZE as u64) as usize;
                let n = file.read(&mut buf[..want]).await?;
                if n == 0 {
                    break;
                }
                remaining -= n as u64;
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    /// Stream a whole chunk with a caller-chosen read buffer. Used by the
    /// assembler for bounded-memory concatenation.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn stream_chunk(
        &self,
        session: &SessionId,
        index: u32,
        buffer_bytes: usize,
    ) -> StorageResult<ByteStream> {
        let path = self.chunk_path(session, index);
        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(self.chunk_path_hint(session, index))
            } else {
                StorageError::Io(e)
            }
        })?;

        let buffer_bytes = buffer_bytes.clamp(4096, 64 * 1024 * 1024);
        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; buffer_bytes];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };
        Ok(Box::pin(stream))
    }

    /// Enumerate a session's chunks as `(index, size)`, ordered by index.
    ///
    /// Walks the shard directories only; files whose names do not parse as a
    /// chunk index (e.g. leftover temp files) are skipped.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn list_session(&self, session: &SessionId) -> StorageResult<Vec<(u32, u64)>> {
        let chunks = self.enumerate_chunks(&self.chunks_dir(session)).await?;
        Ok(chunks.into_iter().collect())
    }

    async fn enumerate_chunks(&self, chunks_dir: &Path) -> StorageResult<BTreeMap<u32, u64>> {
        let mut found = BTreeMap::new();
        let mut shards = match fs::read_dir(chunks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(StorageError::Io(e)),
        };

        while let Some(shard) = shards.next_entry().await.map_err(StorageError::Io)? {
            // Use file_type() instead of path.is_dir() to avoid following
            // symlinks out of the storage root.
            if !shard.file_type().await.map_err(StorageError::Io)?.is_dir() {
                continue;
            }
            if !shard.file_name().to_string_lossy().starts_with("shard_") {
                continue;
            }
            let mut entries = fs::read_dir(shard.path()).await.map_err(StorageError::Io)?;
            while let Some(entry) = entries.next_entry().await.map_err(StorageError::Io)? {
                let file_type = entry.file_type().await.map_err(StorageError::Io)?;
                if !file_type.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let Ok(index) = name.to_string_lossy().parse::<u32>() else {
                    continue;
                };
                let meta = entry.metadata().await.map_err(StorageError::Io)?;
                found.insert(index, meta.len());
            }
        }
        Ok(found)
    }

    /// Scan the storage root for session directories.
    ///
    /// Used to rebuild the session registry after a restart: chunk presence
    /// and sizes come from shard enumeration, completed artifacts from the
    /// completed directory. Directory names are returned raw; the caller
    /// decides which ones are valid session identifiers.
    #[instrument(skip(self))]
    pub async fn scan_sessions(&self) -> StorageResult<Vec<SessionScan>> {
        let mut scans = Vec::new();
        let mut entries = fs::read_dir(&self.root).await.map_err(StorageError::Io)?;

        while let Some(entry) = entries.next_entry().await.map_err(StorageError::Io)? {
            if !entry.file_type().await.map_err(StorageError::Io)?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let session_dir = entry.path();

            let chunks = self.enumerate_chunks(&session_dir.join("chunks")).await?;
            let completed = self.enumerate_completed(&session_dir.join("completed")).await?;
            let last_modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(OffsetDateTime::from);

            scans.push(SessionScan {
                dir_name,
                chunks,
                completed,
                last_modified,
            });
        }
        Ok(scans)
    }

    async fn enumerate_completed(&self, dir: &Path) -> StorageResult<Vec<(String, u64)>> {
        let mut found = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(StorageError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(StorageError::Io)? {
            if !entry.file_type().await.map_err(StorageError::Io)?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".meta") || name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await.map_err(StorageError::Io)?;
            found.push((name, meta.len()));
        }
        Ok(found)
    }

    /// Best-effort recursive removal of the chunks subtree only.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn delete_session_chunks(&self, session: &SessionId) -> StorageResult<()> {
        self.drop_session_locks(session).await;
        match fs::remove_dir_all(self.chunks_dir(session)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Remove everything under `{root}/{session}/`, chunks and artifacts.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn delete_session(&self, session: &SessionId) -> StorageResult<()> {
        self.drop_session_locks(session).await;
        match fs::remove_dir_all(self.session_dir(session)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Begin publishing a completed artifact.
    ///
    /// Bytes stream into a temp file in the completed directory; `finish`
    /// fsyncs and atomically renames to the final name. Nothing is visible
    /// under the final name until then.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn begin_completed(
        &self,
        session: &SessionId,
        file_name: &str,
    ) -> StorageResult<CompletedUpload> {
        validate_file_name(file_name)?;
        let dir = self.completed_dir(session);
        fs::create_dir_all(&dir).await.map_err(StorageError::from_io)?;

        let final_path = dir.join(file_name);
        let temp_path = dir.join(format!(".{file_name}.tmp.{}", Uuid::new_v4()));
        let file = fs::File::create(&temp_path)
            .await
            .map_err(StorageError::from_io)?;

        Ok(CompletedUpload {
            file,
            temp_path,
            final_path,
            bytes_written: 0,
        })
    }

    /// Write the sidecar metadata file with the same atomic-rename
    /// discipline as the artifact itself.
    #[instrument(skip(self, meta), fields(session = %session))]
    pub async fn write_sidecar(
        &self,
        session: &SessionId,
        file_name: &str,
        meta: &ArtifactMeta,
    ) -> StorageResult<PathBuf> {
        validate_file_name(file_name)?;
        let dir = self.completed_dir(session);
        fs::create_dir_all(&dir).await.map_err(StorageError::from_io)?;

        let final_path = dir.join(format!("{file_name}.meta"));
        let temp_path = dir.join(format!(".{file_name}.meta.tmp.{}", Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(meta)?;
        {
            let mut file = fs::File::create(&temp_path)
                .await
                .map_err(StorageError::from_io)?;
            if let Err(e) = file.write_all(&body).await {
                drop(file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(StorageError::from_io(e));
            }
            if let Err(e) = file.sync_all().await {
                drop(file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(StorageError::from_io(e));
            }
        }
        fs::rename(&temp_path, &final_path)
            .await
            .map_err(StorageError::from_io)?;
        Ok(final_path)
    }

    /// Open a completed artifact for reading, with its size.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn open_completed(
        &self,
        session: &SessionId,
        file_name: &str,
    ) -> StorageResult<(fs::File, u64)> {
        validate_file_name(file_name)?;
        let path = self.completed_path(session, file_name);
        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(format!("{}/completed/{file_name}", session.as_str()))
            } else {
                StorageError::Io(e)
            }
        })?;
        let size = file.metadata().await.map_err(StorageError::Io)?.len();
        Ok((file, size))
    }
}

/// Reject artifact names that could escape the completed directory.
fn validate_file_name(name: &str) -> StorageResult<()> {
    if name.is_empty()
        || name.contains(['/', '\\'])
        || name.starts_with('.')
        || name.contains('\0')
    {
        return Err(StorageError::InvalidKey(format!(
            "unsafe file name: {name:?}"
        )));
    }
    Ok(())
}

/// In-flight artifact publication; see [`ChunkStore::begin_completed`].
pub struct CompletedUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

impl CompletedUpload {
    /// Append bytes to the temp file.
    pub async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.file
            .write_all(data)
            .await
            .map_err(StorageError::from_io)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Fsync and atomically rename into place. Returns the final path and
    /// total bytes written.
    pub async fn finish(mut self) -> StorageResult<(PathBuf, u64)> {
        self.file.sync_all().await.map_err(StorageError::from_io)?;
        drop(self.file);
        fs::rename(&self.temp_path, &self.final_path)
            .await
            .map_err(StorageError::from_io)?;
        Ok((self.final_path, self.bytes_written))
    }

    /// Abandon the publication and unlink the temp file.
    pub async fn abort(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }
}
