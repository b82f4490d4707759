//! End-to-end assembly tests: completion signal, racing chunks, artifact
//! and sidecar contents.

mod common;

use axum::body::Body;
use axum::http::StatusCode;
use common::{TestServer, upload_offset};

#[tokio::test]
async fn happy_path_uploads_three_chunks_and_assembles() {
    let server = TestServer::new().await;

    for index in 0..3u32 {
        let response = server.create_slot("sess-a", index, 3, "demo", None).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    server.append("sess-a", 0, 0, &[b'a'; 1000], true).await;
    server.append("sess-a", 1, 0, &[b'b'; 1000], true).await;
    server.append("sess-a", 2, 0, &[b'c'; 500], true).await;

    let (status, body) = server.complete("sess-a", "demo.webm", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["assembly_state"], "pending");

    assert!(server.wait_for_assembly_state("sess-a", "done").await);

    // Artifact has the concatenated size and content order.
    let artifact = server.storage_root().join("sess-a/completed/demo.webm");
    let bytes = std::fs::read(&artifact).unwrap();
    assert_eq!(bytes.len(), 2500);
    assert!(bytes[..1000].iter().all(|b| *b == b'a'));
    assert!(bytes[1000..2000].iter().all(|b| *b == b'b'));
    assert!(bytes[2000..].iter().all(|b| *b == b'c'));

    // Chunk tree is gone; status exposes the artifact path.
    assert!(!server.storage_root().join("sess-a/chunks").exists());
    let (_, status_body) = server
        .request("GET", "/files/sess-a/status", Body::empty(), &[])
        .await;
    assert_eq!(status_body["assembly_state"], "done");
    assert!(
        status_body["artifact_path"]
            .as_str()
            .unwrap()
            .ends_with("demo.webm")
    );

    // The recording can be fetched back.
    let response = server
        .raw_request("GET", "/recordings/sess-a/demo.webm", Body::empty(), &[])
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "audio/webm"
    );
    let fetched = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(fetched.len(), 2500);
}

#[tokio::test]
async fn sidecar_carries_session_and_client_metadata() {
    let server = TestServer::new().await;
    server.create_slot("sess-b", 0, 1, "take", None).await;
    server.append("sess-b", 0, 0, b"audio-bytes", true).await;

    let metadata = r#"{"duration":12.5,"sampleRate":48000,"name":"Take 1"}"#;
    server.complete("sess-b", "take.webm", Some(metadata)).await;
    assert!(server.wait_for_assembly_state("sess-b", "done").await);

    let sidecar = server
        .storage_root()
        .join("sess-b/completed/take.webm.meta");
    let parsed: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&sidecar).unwrap()).unwrap();
    assert_eq!(parsed["session_id"], "sess-b");
    assert_eq!(parsed["file_name"], "take.webm");
    assert_eq!(parsed["total_chunks"], 1);
    assert_eq!(parsed["total_bytes"], 11);
    assert_eq!(parsed["format"], "webm");
    assert_eq!(parsed["client_metadata"]["duration"], "12.5");
    assert_eq!(parsed["client_metadata"]["sampleRate"], "48000");
    assert!(parsed["created_at"].is_string());
    assert!(parsed["completed_at"].is_string());
}

#[tokio::test]
async fn completion_signal_races_the_last_chunk() {
    // The client's queue reorders: chunk 0, completion, then chunk 1.
    let server = TestServer::new().await;
    server.create_slot("sess-c", 0, 2, "race", None).await;
    server.append("sess-c", 0, 0, b"first", true).await;

    let (status, body) = server.complete("sess-c", "race.webm", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["assembly_state"], "pending");
    assert_eq!(body["persisted_count"], 1);

    // Not assembled yet: a chunk is still missing.
    let (_, status_body) = server
        .request("GET", "/files/sess-c/status", Body::empty(), &[])
        .await;
    assert_eq!(status_body["assembly_state"], "pending");
    assert_eq!(status_body["missing_indices"], serde_json::json!([1]));

    // The late chunk arrives and assembly follows without another signal.
    server.append("sess-c", 1, 0, b"-second", true).await;
    assert!(server.wait_for_assembly_state("sess-c", "done").await);

    let artifact = server.storage_root().join("sess-c/completed/race.webm");
    assert_eq!(std::fs::read(&artifact).unwrap(), b"first-second");
}

#[tokio::test]
async fn repeated_completion_signals_publish_once() {
    let server = TestServer::new().await;
    server.create_slot("sess-d", 0, 1, "dup", None).await;
    server.append("sess-d", 0, 0, b"payload", true).await;

    for _ in 0..4 {
        let (status, _) = server.complete("sess-d", "dup.webm", None).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert!(server.wait_for_assembly_state("sess-d", "done").await);

    let artifact = server.storage_root().join("sess-d/completed/dup.webm");
    assert_eq!(std::fs::read(&artifact).unwrap(), b"payload");

    // A signal after done reports done and changes nothing.
    let (status, body) = server.complete("sess-d", "dup.webm", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["assembly_state"], "done");
}

#[tokio::test]
async fn manual_assemble_is_equivalent_to_the_signal() {
    let server = TestServer::new().await;
    server.create_slot("sess-e", 0, 1, "manual", None).await;
    server.append("sess-e", 0, 0, b"manual-bytes", true).await;

    let (status, body) = server
        .request("POST", "/files/sess-e/assemble", Body::empty(), &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["assembly_state"], "pending");

    assert!(server.wait_for_assembly_state("sess-e", "done").await);
    // No completion file name was given, so create-time metadata names it.
    let artifact = server.storage_root().join("sess-e/completed/manual.webm");
    assert_eq!(std::fs::read(&artifact).unwrap(), b"manual-bytes");

    let (status, _) = server
        .request("POST", "/files/ghost/assemble", Body::empty(), &[])
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn appends_are_refused_after_assembly() {
    let server = TestServer::new().await;
    server.create_slot("sess-f", 0, 1, "sealed", None).await;
    server.append("sess-f", 0, 0, b"sealed", true).await;
    server.complete("sess-f", "sealed.webm", None).await;
    assert!(server.wait_for_assembly_state("sess-f", "done").await);

    let response = server.append("sess-f", 0, 0, b"more", false).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = server.create_slot("sess-f", 0, 1, "sealed", None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn done_session_can_still_be_cancelled_to_free_storage() {
    let server = TestServer::new().await;
    server.create_slot("sess-g", 0, 1, "freed", None).await;
    server.append("sess-g", 0, 0, b"freed", true).await;
    server.complete("sess-g", "freed.webm", None).await;
    assert!(server.wait_for_assembly_state("sess-g", "done").await);

    let (status, _) = server
        .request("DELETE", "/files/sess-g", Body::empty(), &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!server.storage_root().join("sess-g").exists());
}

#[tokio::test]
async fn fallback_only_session_assembles_via_completion_metadata() {
    // The service-worker path never creates slots; the completion blob's
    // totalChunks is what tells the server the session's shape.
    let server = TestServer::new().await;

    let multipart_body = |index: u32, bytes: &[u8]| {
        let boundary = "X-WAVEFORGE-TEST";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"session_id\"\r\n\r\nsess-sw\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"chunk_index\"\r\n\r\n{index}\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"chunk\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    };

    for (index, bytes) in [(0u32, b"sw-one-".as_slice()), (1, b"sw-two".as_slice())] {
        let (status, body) = server
            .request(
                "POST",
                "/upload/chunk",
                Body::from(multipart_body(index, bytes)),
                &[(
                    "Content-Type",
                    "multipart/form-data; boundary=X-WAVEFORGE-TEST",
                )],
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "chunk_received");
    }

    let (status, body) = server
        .complete("sess-sw", "sw.webm", Some(r#"{"totalChunks":2}"#))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_chunks"], 2);

    assert!(server.wait_for_assembly_state("sess-sw", "done").await);
    let artifact = server.storage_root().join("sess-sw/completed/sw.webm");
    assert_eq!(std::fs::read(&artifact).unwrap(), b"sw-one-sw-two");
}

#[tokio::test]
async fn offsets_grow_strictly_across_many_appends() {
    let server = TestServer::new().await;
    server.create_slot("sess-h", 0, 1, "mono", None).await;

    let mut offset = 0u64;
    for round in 0..10u64 {
        let payload = vec![round as u8; 37];
        let response = server.append("sess-h", 0, offset, &payload, round == 9).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let new_offset = upload_offset(&response);
        assert_eq!(new_offset, offset + 37);
        offset = new_offset;
    }

    server.complete("sess-h", "mono.webm", None).await;
    assert!(server.wait_for_assembly_state("sess-h", "done").await);
    let artifact = server.storage_root().join("sess-h/completed/mono.webm");
    assert_eq!(std::fs::read(&artifact).unwrap().len(), 370);
}
