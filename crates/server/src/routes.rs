//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, patch, post};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Slack over `max_chunk_bytes` for multipart framing overhead.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let body_limit = (state.config.server.max_chunk_bytes + MULTIPART_OVERHEAD) as usize;

    let mut router = Router::new()
        // Health check (unauthenticated; get() also answers HEAD)
        .route("/health", get(handlers::health_check))
        // Resumable upload surface
        .route(
            "/files/{session_id}/chunks/",
            post(handlers::create_chunk_slot),
        )
        .route(
            "/files/{session_id}/chunks/{chunk_index}",
            patch(handlers::append_chunk).head(handlers::probe_chunk),
        )
        .route(
            "/files/{session_id}/chunks/{chunk_index}/verify",
            get(handlers::verify_chunk),
        )
        .route("/files/{session_id}/status", get(handlers::get_status))
        .route(
            "/files/{session_id}/assemble",
            post(handlers::trigger_assembly),
        )
        .route("/files/{session_id}", delete(handlers::cancel_session))
        // Completion signal
        .route("/recording/complete", post(handlers::recording_complete))
        // One-shot fallback upload
        .route("/upload/chunk", post(handlers::upload_chunk_multipart))
        // Completed artifact retrieval
        .route(
            "/recordings/{session_id}/{file_name}",
            get(handlers::get_recording),
        );

    // Conditionally expose Prometheus metrics.
    // SECURITY: when enabled, restrict this endpoint to authorized scraper
    // IPs at the infrastructure level.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        // The browser client talks to us cross-origin; the original server
        // answered preflights permissively and so do we.
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(state.config.server.request_timeout()))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
