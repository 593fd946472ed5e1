use crate::config::{load_config, Config, ConfigError, FileSettingsSource};
use crate::progress::ProgressProjector;
use crate::reconcile::{Clustering, ReconcileError, Reconciler, Scheduler};
use crate::storage::{DuckDbStorage, EquipmentFilter, Storage, StorageError};
use crate::web::{run_server, AppState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config not found (searched ~/.config/coordinator/config.yml and /etc/coordinator/config.yml). Use --config <path> or run 'coordinator config init'")]
    ConfigNotFound,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("web server error: {0}")]
    WebServer(String),
}

/// Run the scheduler and web API until Ctrl+C.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path.ok_or(RunError::ConfigNotFound)?;
    run_service(&config_path).await.map_err(|e| e.into())
}

/// Run exactly one reconciliation pass and print its summary.
pub async fn reconcile_once(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path.ok_or(RunError::ConfigNotFound)?;
    single_pass(&config_path).await.map_err(|e| e.into())
}

/// Print the progress board as JSON.
pub async fn print_progress(
    config_path: Option<PathBuf>,
    types: Vec<String>,
    line: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path.ok_or(RunError::ConfigNotFound)?;
    progress_board(&config_path, EquipmentFilter { types, line })
        .await
        .map_err(|e| e.into())
}

async fn open_storage(config: &Config) -> Result<Arc<DuckDbStorage>, RunError> {
    if let Some(parent) = config.storage.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    info!(path = %config.storage.path.display(), "Initializing storage");
    let storage = Arc::new(DuckDbStorage::new(&config.storage.path)?);
    storage.init_schema().await?;
    Ok(storage)
}

async fn run_service(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let storage: Arc<dyn Storage> = open_storage(&config).await?;
    let clustering = Clustering::from(&config.reconcile);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(storage.clone(), clustering);
    let (scheduler, scheduler_status) = Scheduler::new(
        reconciler,
        Arc::new(FileSettingsSource::new(config_path)),
        config.reconcile.clone(),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let state = AppState {
        storage: storage.clone(),
        projector: Arc::new(ProgressProjector::new(storage.clone(), clustering)),
        scheduler: Some(scheduler_status),
    };
    info!("Starting web server on {}", config.web.listen);
    let web_config = config.web.clone();
    let web_shutdown = shutdown_rx.clone();
    let mut web_handle = tokio::spawn(async move {
        run_server(state, web_config, web_shutdown)
            .await
            .map_err(|e| RunError::WebServer(e.to_string()))
    });

    info!("Coordinator started, press Ctrl+C to shutdown");

    let mut web_finished = false;
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = &mut web_handle => {
            web_finished = true;
            match result {
                Ok(Ok(())) => warn!("Web server exited"),
                Ok(Err(e)) => error!(error = %e, "Web server error"),
                Err(e) => error!(error = %e, "Web server task join error"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Scheduler task join error");
    }

    if !web_finished {
        match web_handle.await {
            Ok(Ok(())) => info!("Web server stopped"),
            Ok(Err(e)) => error!(error = %e, "Web server error"),
            Err(e) => error!(error = %e, "Web server task join error"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn single_pass(config_path: &Path) -> Result<(), RunError> {
    let config = load_config(config_path)?;
    let storage: Arc<dyn Storage> = open_storage(&config).await?;

    let reconciler = Reconciler::new(storage, Clustering::from(&config.reconcile));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let summary = reconciler.run_pass(&shutdown_rx).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn progress_board(config_path: &Path, filter: EquipmentFilter) -> Result<(), RunError> {
    let config = load_config(config_path)?;
    let storage: Arc<dyn Storage> = open_storage(&config).await?;

    let projector = ProgressProjector::new(storage, Clustering::from(&config.reconcile));
    let board = projector.board(&filter).await?;

    println!("{}", serde_json::to_string_pretty(&board)?);
    Ok(())
}
