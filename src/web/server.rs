use axum::{
    routing::{get, post, put},
    Router,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::config::WebConfig;

use super::api::{
    create_batch, delete_batch, get_batch, get_progress, get_scheduler, health_check, list_equipment,
    update_note, AppState,
};

/// Build the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/progress", get(get_progress))
        .route("/api/equipment", get(list_equipment))
        .route("/api/equipment/:name/note", put(update_note))
        .route("/api/batches", post(create_batch))
        .route("/api/batches/:batch_id", get(get_batch).delete(delete_batch))
        .route("/api/scheduler", get(get_scheduler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the web server and serve until shutdown is signalled
pub async fn run_server(
    state: AppState,
    web_config: WebConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&web_config.listen).await?;
    tracing::info!("Web server listening on {}", web_config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|&v| v).await;
            tracing::info!("Web server shutting down gracefully");
        })
        .await?;

    Ok(())
}
