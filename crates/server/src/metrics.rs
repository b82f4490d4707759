//! Prometheus metrics for the WaveForge server.
//!
//! Exposes metrics for session lifecycle, chunk appends, assembly, and the
//! sweeper. The `/metrics` endpoint is unauthenticated so Prometheus can
//! scrape it; restrict it to scraper IPs at the infrastructure level and do
//! not expose it on public networks.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Session lifecycle
pub static SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "waveforge_sessions_created_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_SWEPT: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "waveforge_sessions_swept_total",
        "Total number of sessions reclaimed by the sweeper",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "waveforge_sessions_active",
        "Number of session records currently in the registry",
    )
    .expect("metric creation failed")
});

// Chunk ingestion
pub static CHUNKS_APPENDED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "waveforge_chunk_appends_total",
        "Total number of accepted chunk appends",
    )
    .expect("metric creation failed")
});

pub static BYTES_APPENDED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "waveforge_chunk_bytes_total",
        "Total chunk bytes accepted and fsynced",
    )
    .expect("metric creation failed")
});

pub static OFFSET_MISMATCHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "waveforge_offset_mismatches_total",
        "Appends rejected because the declared offset did not match disk",
    )
    .expect("metric creation failed")
});

pub static APPEND_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "waveforge_append_duration_seconds",
        "Wall time of a chunk append, including the fsync",
    ))
    .expect("metric creation failed")
});

// Assembly
pub static ASSEMBLIES_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "waveforge_assemblies_completed_total",
        "Assemblies that published an artifact",
    )
    .expect("metric creation failed")
});

pub static ASSEMBLIES_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "waveforge_assemblies_failed_total",
        "Assemblies that reached the failed state",
    )
    .expect("metric creation failed")
});

pub static ASSEMBLIES_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "waveforge_assemblies_active",
        "Assembly tasks currently running",
    )
    .expect("metric creation failed")
});

pub static ASSEMBLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "waveforge_assembly_duration_seconds",
        "Wall time of a successful assembly run",
    ))
    .expect("metric creation failed")
});

/// Upload errors by kind, for alerting on repeated transient failures.
pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("waveforge_upload_errors_total", "Upload errors by kind"),
        &["kind"],
    )
    .expect("metric creation failed")
});

/// Record an upload error by kind.
pub fn record_upload_error(kind: &str) {
    UPLOAD_ERRORS.with_label_values(&[kind]).inc();
}

/// Register all metrics with the global registry. Idempotent.
pub fn register_metrics() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(SESSIONS_CREATED.clone()),
            Box::new(SESSIONS_SWEPT.clone()),
            Box::new(SESSIONS_ACTIVE.clone()),
            Box::new(CHUNKS_APPENDED.clone()),
            Box::new(BYTES_APPENDED.clone()),
            Box::new(OFFSET_MISMATCHES.clone()),
            Box::new(APPEND_DURATION.clone()),
            Box::new(ASSEMBLIES_COMPLETED.clone()),
            Box::new(ASSEMBLIES_FAILED.clone()),
            Box::new(ASSEMBLIES_ACTIVE.clone()),
            Box::new(ASSEMBLY_DURATION.clone()),
            Box::new(UPLOAD_ERRORS.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus text exposition.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    match encoder.encode(&families, &mut buf) {
        Ok(()) => (StatusCode::OK, buf).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_and_encodes() {
        register_metrics();
        register_metrics();

        SESSIONS_CREATED.inc();
        record_upload_error("offset_mismatch");

        let families = REGISTRY.gather();
        assert!(
            families
                .iter()
                .any(|f| f.get_name() == "waveforge_sessions_created_total")
        );
    }
}
