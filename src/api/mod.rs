mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cli::Settings;
use crate::storage::TraceStore;
use crate::storage::json_store::JsonTraceStore;

pub use errors::{AppError, ErrorResponse};

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub store: Arc<dyn TraceStore>,
    /// Storage volume probed by `/health/storage`.
    pub data_dir: PathBuf,
    pub pointer_path: PathBuf,
}

/// Build the read-only router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/traces", get(handlers::list_traces))
        .route("/traces/{id}", get(handlers::get_trace))
        .route("/health", get(handlers::health))
        .route("/health/storage", get(handlers::storage_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the REST API server.
pub async fn serve(host: &str, port: u16, settings: &Settings) -> Result<()> {
    let state = Arc::new(AppState {
        store: Arc::new(JsonTraceStore::new(&settings.trace_dir)),
        data_dir: settings.data_dir.clone(),
        pointer_path: settings.pointer_path.clone(),
    });

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("CommitFlow API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
