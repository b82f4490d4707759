//! Shared test utilities.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio::sync::watch;
use tower::ServiceExt;
use waveforge_core::AppConfig;
use waveforge_server::{
    AppState, AssemblyTaskRegistry, CompletionCoordinator, SessionRegistry, create_router,
};
use waveforge_storage::ChunkStore;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub shutdown_tx: watch::Sender<bool>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server with temporary storage and tight retry timings.
    pub async fn new() -> Self {
        Self::with_config(AppConfig::for_testing()).await
    }

    pub async fn with_config(mut config: AppConfig) -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");
        config.storage.root = temp_dir.path().join("uploads");
        let config = Arc::new(config);

        let store = Arc::new(
            ChunkStore::new(&config.storage.root)
                .await
                .expect("failed to create chunk store"),
        );
        let registry = Arc::new(SessionRegistry::new());
        registry.hydrate(&store, OffsetDateTime::now_utc()).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let assembly_tasks = Arc::new(AssemblyTaskRegistry::new(registry.clone()));
        let coordinator = Arc::new(CompletionCoordinator::new(
            config.clone(),
            store.clone(),
            registry.clone(),
            assembly_tasks,
            shutdown_rx.clone(),
        ));

        let state = AppState::new(config, store, registry, coordinator, shutdown_rx);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            shutdown_tx,
            _temp_dir: temp_dir,
        }
    }

    /// Storage root for direct filesystem assertions.
    pub fn storage_root(&self) -> std::path::PathBuf {
        self.state.store.root().to_path_buf()
    }

    /// Wait until a session reaches the wanted assembly state.
    pub async fn wait_for_assembly_state(&self, session_id: &str, want: &str) -> bool {
        for _ in 0..100 {
            let (status, body) = self
                .request("GET", &format!("/files/{session_id}/status"), Body::empty(), &[])
                .await;
            if status == StatusCode::OK && body["assembly_state"] == want {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        false
    }

    /// Issue a request against the router and parse the JSON body (if any).
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Body,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let response = self.raw_request(method, uri, body, headers).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// Issue a request and return the raw response (for header assertions).
    pub async fn raw_request(
        &self,
        method: &str,
        uri: &str,
        body: Body,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(body).unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Create a chunk slot with recorder-style tus metadata.
    pub async fn create_slot(
        &self,
        session_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        recording_name: &str,
        announced_len: Option<u64>,
    ) -> axum::response::Response {
        let metadata = tus_metadata(&[
            ("chunkIndex", &chunk_index.to_string()),
            ("totalChunks", &total_chunks.to_string()),
            ("recordingName", recording_name),
            ("format", "webm"),
        ]);
        let mut headers: Vec<(&str, String)> = vec![
            ("Upload-Metadata", metadata),
            ("Tus-Resumable", "1.0.0".to_string()),
        ];
        if let Some(len) = announced_len {
            headers.push(("Upload-Length", len.to_string()));
        }
        let header_refs: Vec<(&str, &str)> = headers
            .iter()
            .map(|(name, value)| (*name, value.as_str()))
            .collect();
        self.raw_request(
            "POST",
            &format!("/files/{session_id}/chunks/"),
            Body::empty(),
            &header_refs,
        )
        .await
    }

    /// Append bytes to a chunk at the declared offset.
    pub async fn append(
        &self,
        session_id: &str,
        chunk_index: u32,
        offset: u64,
        bytes: &[u8],
        final_flag: bool,
    ) -> axum::response::Response {
        let offset_string = offset.to_string();
        let mut headers = vec![
            ("Upload-Offset", offset_string.as_str()),
            ("Content-Type", "application/offset+octet-stream"),
            ("Tus-Resumable", "1.0.0"),
        ];
        if final_flag {
            headers.push(("Upload-Complete", "1"));
        }
        self.raw_request(
            "PATCH",
            &format!("/files/{session_id}/chunks/{chunk_index}"),
            Body::from(bytes.to_vec()),
            &headers,
        )
        .await
    }

    /// Probe the accepted offset of a chunk.
    pub async fn probe(&self, session_id: &str, chunk_index: u32) -> axum::response::Response {
        self.raw_request(
            "HEAD",
            &format!("/files/{session_id}/chunks/{chunk_index}"),
            Body::empty(),
            &[("Tus-Resumable", "1.0.0")],
        )
        .await
    }

    /// Send the completion signal as the form post the client uses.
    pub async fn complete(
        &self,
        session_id: &str,
        file_name: &str,
        metadata_json: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut form = format!(
            "session_id={}&file_name={}",
            urlencode(session_id),
            urlencode(file_name)
        );
        if let Some(metadata) = metadata_json {
            form.push_str(&format!("&metadata={}", urlencode(metadata)));
        }
        self.request(
            "POST",
            "/recording/complete",
            Body::from(form),
            &[("Content-Type", "application/x-www-form-urlencoded")],
        )
        .await
    }
}

/// Encode recorder-style tus `Upload-Metadata` pairs.
#[allow(dead_code)]
pub fn tus_metadata(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{key} {}", BASE64.encode(value.as_bytes())))
        .collect::<Vec<_>>()
        .join(",")
}

/// Percent-encode a form value (enough for the characters tests use).
#[allow(dead_code)]
pub fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push_str("%20"),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Read the Upload-Offset header of a response.
#[allow(dead_code)]
pub fn upload_offset(response: &axum::response::Response) -> u64 {
    response
        .headers()
        .get("Upload-Offset")
        .expect("missing Upload-Offset header")
        .to_str()
        .unwrap()
        .parse()
        .unwrap()
}
