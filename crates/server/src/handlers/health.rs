//! Liveness probe.
//!
//! Intentionally unauthenticated and cheap: the recorder client hits this
//! to distinguish "network down" from "server down" before deciding whether
//! to drain its local queue. Registered with `get`, which also serves HEAD.

use crate::handlers::common::rfc3339;
use axum::Json;
use time::OffsetDateTime;
use waveforge_core::api::HealthResponse;

/// GET|HEAD /health - Liveness token.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: rfc3339(OffsetDateTime::now_utc()),
    })
}
