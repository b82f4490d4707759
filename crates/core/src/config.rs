//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub assembly: AssemblyConfig,
}

impl AppConfig {
    /// Configuration for tests: tight timings, a placeholder storage root
    /// the test harness replaces with a temp directory.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig {
                bind: "127.0.0.1:0".to_string(),
                metrics_enabled: false,
                ..ServerConfig::default()
            },
            storage: StorageConfig {
                root: PathBuf::from("./data/test-uploads"),
            },
            sessions: SessionConfig {
                ttl_active_secs: 3600,
                ttl_completed_secs: 3600,
                sweep_interval_secs: 3600,
                ..SessionConfig::default()
            },
            assembly: AssemblyConfig {
                retry_initial_secs: 1,
                retry_max_secs: 2,
                ..AssemblyConfig::default()
            },
        }
    }
}

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g. "0.0.0.0:8000").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Cap for a single append body, in bytes.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,
    /// Per-request deadline in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// When enabled, restrict the endpoint to scraper IPs at the
    /// infrastructure level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

impl ServerConfig {
    /// Per-request deadline as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_chunk_bytes: default_max_chunk_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Chunk storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all session data.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

/// Session registry and sweeper configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity window before an active session is swept, in seconds.
    #[serde(default = "default_ttl_active_secs")]
    pub ttl_active_secs: u64,
    /// Retention for completed artifacts, in seconds.
    #[serde(default = "default_ttl_completed_secs")]
    pub ttl_completed_secs: u64,
    /// Sweeper period, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Allowed characters for session identifiers.
    #[serde(default = "default_id_alphabet")]
    pub id_alphabet: String,
}

impl SessionConfig {
    pub fn ttl_active(&self) -> time::Duration {
        saturating_secs(self.ttl_active_secs)
    }

    pub fn ttl_completed(&self) -> time::Duration {
        saturating_secs(self.ttl_completed_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        // Guard against a zero interval, which would make
        // tokio::time::interval panic.
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_active_secs: default_ttl_active_secs(),
            ttl_completed_secs: default_ttl_completed_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            id_alphabet: default_id_alphabet(),
        }
    }
}

/// Assembler and completion-coordinator configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Streaming-copy buffer size during assembly, in bytes.
    #[serde(default = "default_assembly_buffer_bytes")]
    pub buffer_bytes: usize,
    /// Initial completion-retry backoff, in seconds.
    #[serde(default = "default_retry_initial_secs")]
    pub retry_initial_secs: u64,
    /// Completion-retry backoff cap, in seconds.
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
}

impl AssemblyConfig {
    pub fn retry_initial(&self) -> Duration {
        Duration::from_secs(self.retry_initial_secs.max(1))
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_secs(self.retry_max_secs.max(self.retry_initial_secs).max(1))
    }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: default_assembly_buffer_bytes(),
            retry_initial_secs: default_retry_initial_secs(),
            retry_max_secs: default_retry_max_secs(),
        }
    }
}

fn saturating_secs(secs: u64) -> time::Duration {
    // Saturate at i64::MAX to prevent overflow wrapping to negative.
    time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_max_chunk_bytes() -> u64 {
    crate::DEFAULT_MAX_CHUNK_BYTES
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/uploads")
}

fn default_ttl_active_secs() -> u64 {
    24 * 3600
}

fn default_ttl_completed_secs() -> u64 {
    7 * 24 * 3600
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_id_alphabet() -> String {
    crate::session::DEFAULT_SESSION_ID_ALPHABET.to_string()
}

fn default_assembly_buffer_bytes() -> usize {
    crate::DEFAULT_ASSEMBLY_BUFFER_BYTES
}

fn default_retry_initial_secs() -> u64 {
    3
}

fn default_retry_max_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert_eq!(config.sessions.sweep_interval_secs, 3600);
        assert_eq!(config.assembly.buffer_bytes, 1024 * 1024);
        assert!(config.assembly.retry_initial() <= config.assembly.retry_max());
    }

    #[test]
    fn zero_intervals_are_guarded() {
        let sessions = SessionConfig {
            sweep_interval_secs: 0,
            ..SessionConfig::default()
        };
        assert_eq!(sessions.sweep_interval(), Duration::from_secs(1));

        let assembly = AssemblyConfig {
            retry_initial_secs: 0,
            retry_max_secs: 0,
            ..AssemblyConfig::default()
        };
        assert_eq!(assembly.retry_initial(), Duration::from_secs(1));
        assert!(assembly.retry_max() >= assembly.retry_initial());
    }

    #[test]
    fn ttl_saturates_instead_of_overflowing() {
        let sessions = SessionConfig {
            ttl_active_secs: u64::MAX,
            ..SessionConfig::default()
        };
        assert_eq!(sessions.ttl_active(), time::Duration::seconds(i64::MAX));
    }
}
