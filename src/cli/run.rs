use crate::bus::LocalBus;
use crate::cache::MemoryCache;
use crate::config::parse::load_config;
use crate::config::Config;
use crate::pipeline::{LocationPipeline, PipelineBackends};
use crate::storage::{DuckDbStorage, LocationStore};
use crate::web::{run_server, AppState};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config not found; searched ~/.config/fleetline/config.yml and /etc/fleetline/config.yml (use --config or run 'fleetline config init')")]
    ConfigNotFound,

    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("web server error: {0}")]
    WebServer(String),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let config_path = config_path.ok_or(RunError::ConfigNotFound)?;

    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(&config_path)?;

    run_service(config, &config_path).await
}

async fn run_service(config: Config, config_path: &Path) -> Result<(), RunError> {
    // Initialize storage
    info!(path = %config.storage.path.display(), "Initializing storage");
    if let Some(parent) = config.storage.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::storage::StorageError::Database(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }
    let store = Arc::new(DuckDbStorage::new(&config.storage.path)?);
    let cache = Arc::new(MemoryCache::new());
    let bus = Arc::new(LocalBus::new(config.broadcast.capacity));

    // Start batching and the processing workers
    let pipeline = LocationPipeline::start(
        &config,
        PipelineBackends {
            store: store.clone(),
            cache: cache.clone(),
            bus,
        },
    )
    .await?;

    // Shutdown signal shared by the web server and the purge sweep
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let purge_handle = tokio::spawn(run_purge_sweep(store.clone(), shutdown_rx.clone()));

    // Spawn web server if enabled
    let web_handle = if config.web.enabled {
        info!("Starting web server on {}", config.web.listen);
        let state = AppState {
            pipeline: pipeline.clone(),
            cache,
        };
        let web_config = config.web.clone();
        let web_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            run_server(state, web_config, web_shutdown)
                .await
                .map_err(|e| RunError::WebServer(e.to_string()))
        }))
    } else {
        None
    };

    info!(config_path = %config_path.display(), "Pipeline started, press Ctrl+C to shutdown");

    // Wait for shutdown signal
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Stop taking HTTP traffic before draining the pipeline
    if let Some(handle) = web_handle {
        match handle.await {
            Ok(Ok(())) => info!("Web server stopped"),
            Ok(Err(e)) => error!(error = %e, "Web server error"),
            Err(e) => error!(error = %e, "Web server join error"),
        }
    }

    // Flush pending batches and drain the queues
    pipeline.shutdown().await?;
    purge_handle.await?;

    info!("Shutdown complete");
    Ok(())
}

/// Periodically delete rows whose expiry has passed.
async fn run_purge_sweep(store: Arc<dyn LocationStore>, shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    let shutdown = wait_for_shutdown(shutdown_rx);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match store.purge_expired(Utc::now().timestamp_millis()).await {
                    Ok(0) => debug!("No expired locations to purge"),
                    Ok(purged) => info!(purged, "Purged expired locations"),
                    Err(e) => warn!(error = %e, "Failed to purge expired locations"),
                }
            }
            _ = &mut shutdown => break,
        }
    }
    debug!("Purge sweep stopped");
}

/// Resolves once shutdown is signalled or the sender is gone. The watch
/// guard is dropped inside, so callers stay `Send`.
async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|&v| v).await;
}
