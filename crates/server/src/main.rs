//! WaveForge server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waveforge_core::AppConfig;
use waveforge_server::{
    AppState, AssemblyTaskRegistry, CompletionCoordinator, SessionRegistry, create_router,
};
use waveforge_storage::ChunkStore;

/// WaveForge - resumable upload and assembly server
#[derive(Parser, Debug)]
#[command(name = "waveforged")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "WAVEFORGE_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("WaveForge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration: TOML file if present, WAVEFORGE_ env vars on top.
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::info!("No config file at {}, using defaults and environment", args.config);
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("WAVEFORGE_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    let config = Arc::new(config);

    // Register Prometheus metrics
    waveforge_server::metrics::register_metrics();

    // Initialize chunk storage and verify it is usable before serving.
    let store = Arc::new(
        ChunkStore::new(&config.storage.root)
            .await
            .with_context(|| {
                format!("failed to open storage root {}", config.storage.root.display())
            })?,
    );
    tracing::info!(root = %config.storage.root.display(), "Chunk store initialized");

    // Rebuild the session registry from whatever survived on disk.
    let registry = Arc::new(SessionRegistry::new());
    let restored = registry.hydrate(&store, OffsetDateTime::now_utc()).await;
    waveforge_server::metrics::SESSIONS_ACTIVE.set(registry.len().await as i64);
    tracing::info!(restored, "Session registry rehydrated");

    // Shutdown signal observed by every background task.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Assembly task registry with its panic watchdog.
    let assembly_tasks = Arc::new(AssemblyTaskRegistry::new(registry.clone()));
    let _watchdog = assembly_tasks.clone().spawn_watchdog();

    let coordinator = Arc::new(CompletionCoordinator::new(
        config.clone(),
        store.clone(),
        registry.clone(),
        assembly_tasks.clone(),
        shutdown_rx.clone(),
    ));

    let state = AppState::new(
        config.clone(),
        store.clone(),
        registry.clone(),
        coordinator,
        shutdown_rx.clone(),
    );

    // Periodic sweep of expired sessions and artifacts.
    let sweeper = waveforge_server::sweeper::spawn_sweeper(
        config.clone(),
        store.clone(),
        registry.clone(),
        shutdown_rx,
    );

    let app = create_router(state);
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background loops, then let any in-flight assembly finish.
    tracing::info!("Shutting down, draining in-flight assembly");
    let _ = shutdown_tx.send(true);
    assembly_tasks.drain().await;
    let _ = sweeper.await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
