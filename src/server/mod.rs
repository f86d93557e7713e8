/// HTTP API for the backup subsystem.
///
/// A thin routing layer over [`BackupManager`] and [`RestoreCoordinator`].
/// Every `/backup` route requires the configured key in the `x-api-key`
/// header.
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::backup::BackupManager;
use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::restore::RestoreCoordinator;
use crate::storage::RemoteStore;

/// Shared application state available to all handlers.
pub struct AppState {
    pub backups: BackupManager,
    pub restorer: RestoreCoordinator,
    /// Live paths and API key.
    pub config: Config,
}

impl AppState {
    pub fn new(store: Arc<dyn RemoteStore>, config: Config) -> Self {
        Self {
            backups: BackupManager::new(store.clone(), config.backup.clone()),
            restorer: RestoreCoordinator::new(store, config.backup.clone()),
            config,
        }
    }
}

/// Build the Axum application with all routes and middleware.
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::backup_routes())
        .with_state(Arc::new(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Start the API server.
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BackupError::Config(format!("cannot bind {addr}: {e}")))?;

    tracing::info!("imgvault API server listening on {addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
