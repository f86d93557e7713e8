/// REST routes for creating, listing, restoring and deleting backups.
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::middleware::ApiKey;
use super::AppState;
use crate::backup::{BackupGroupDescriptor, GroupListing, OperationStatus};
use crate::error::BackupError;
use crate::restore::RestoreResult;

/// Error body returned by every route.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// A [`BackupError`] labelled with the operation that failed.
#[derive(Debug)]
pub struct ApiError {
    context: &'static str,
    error: BackupError,
}

impl ApiError {
    fn context(context: &'static str) -> impl FnOnce(BackupError) -> ApiError {
        move |error| ApiError { context, error }
    }

    fn status(&self) -> StatusCode {
        match self.error {
            BackupError::NotFound { .. } => StatusCode::NOT_FOUND,
            BackupError::IncompleteBackup { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BackupError::Authentication { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BackupError::RemoteStore { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = format!("{}: {}", self.context, self.error);
        if status.is_server_error() {
            error!(status = status.as_u16(), %detail, "Backup request failed");
        } else {
            warn!(status = status.as_u16(), %detail, "Backup request rejected");
        }
        (status, Json(ErrorResponse { detail })).into_response()
    }
}

// ─── Health ──────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

// ─── Backup ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct BackupResponse {
    status: &'static str,
    message: &'static str,
    details: BackupGroupDescriptor,
}

/// POST /backup/backup: Back up the live database and asset tree.
async fn create_backup(
    _key: ApiKey,
    State(state): State<Arc<AppState>>,
) -> Result<Json<BackupResponse>, ApiError> {
    let details = state
        .backups
        .create_full_backup(&state.config.db_path, &state.config.upload_dir)
        .await
        .map_err(ApiError::context("Backup failed"))?;

    Ok(Json(BackupResponse {
        status: "success",
        message: "Full backup completed",
        details,
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

/// GET /backup/backups?limit=N: Newest groups first.
async fn list_backups(
    _key: ApiKey,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<GroupListing>, ApiError> {
    let listing = state
        .backups
        .list_groups(params.limit.unwrap_or(10))
        .await
        .map_err(ApiError::context("Failed to list backups"))?;
    Ok(Json(listing))
}

/// POST /backup/restore/{folder_id}: Overwrite live state from a group.
async fn restore_backup(
    _key: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(folder_id): Path<String>,
) -> Result<Json<RestoreResult>, ApiError> {
    let result = state
        .restorer
        .restore_group(&folder_id, &state.config.db_path, &state.config.upload_dir)
        .await
        .map_err(ApiError::context("Restore failed"))?;
    Ok(Json(result))
}

/// DELETE /backup/{folder_id}: Remove a group and its members.
async fn delete_backup(
    _key: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(folder_id): Path<String>,
) -> Result<Json<OperationStatus>, ApiError> {
    let status = state
        .backups
        .delete_group(&folder_id)
        .await
        .map_err(ApiError::context("Failed to delete backup"))?;
    Ok(Json(status))
}

pub fn backup_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/backup/backup", post(create_backup))
        .route("/backup/backups", get(list_backups))
        .route("/backup/restore/{folder_id}", post(restore_backup))
        .route("/backup/{folder_id}", delete(delete_backup))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupSettings, Config};
    use crate::server::{build_app, AppState};
    use crate::storage::memory::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    struct Harness {
        _dir: TempDir,
        app: Router,
        store: Arc<MemoryStore>,
    }

    fn harness(with_live_data: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("data/images.db");
        let upload_dir = dir.path().join("uploads");
        if with_live_data {
            fs::create_dir_all(db_path.parent().unwrap()).unwrap();
            fs::write(&db_path, b"sqlite bytes").unwrap();
            fs::create_dir_all(upload_dir.join("w300")).unwrap();
            fs::write(upload_dir.join("w300/a.webp"), b"webp").unwrap();
        }
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();

        let config = Config {
            db_path,
            upload_dir,
            api_key: KEY.into(),
            backup: BackupSettings {
                staging_dir: staging,
                ..Default::default()
            },
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new());
        let app = build_app(AppState::new(store.clone(), config));
        Harness {
            _dir: dir,
            app,
            store,
        }
    }

    fn request(method: &str, uri: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(false);
        let (status, body) = send(&h.app, request("GET", "/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_backup_routes_require_api_key() {
        let h = harness(true);
        let (status, body) = send(&h.app, request("GET", "/backup/backups", None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["detail"], "Invalid API Key");

        let (status, _) = send(&h.app, request("POST", "/backup/backup", Some("wrong"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_backup_list_and_delete_flow() {
        let h = harness(true);

        let (status, body) = send(&h.app, request("POST", "/backup/backup", Some(KEY))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        let group_id = body["details"]["group_id"].as_str().unwrap().to_string();
        assert!(body["details"]["uploads"]["name"]
            .as_str()
            .unwrap()
            .ends_with(".zip"));

        let (status, body) = send(&h.app, request("GET", "/backup/backups?limit=5", Some(KEY))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["groups"][0]["folder_id"], group_id.as_str());
        assert_eq!(body["groups"][0]["restorable"], true);

        let uri = format!("/backup/{group_id}");
        let (status, body) = send(&h.app, request("DELETE", &uri, Some(KEY))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Backup group deleted");
        assert!(!h.store.exists(&group_id));

        let (_, body) = send(&h.app, request("GET", "/backup/backups", Some(KEY))).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let h = harness(true);
        let (_, body) = send(&h.app, request("POST", "/backup/backup", Some(KEY))).await;
        let group_id = body["details"]["group_id"].as_str().unwrap().to_string();

        let uri = format!("/backup/restore/{group_id}");
        let (status, body) = send(&h.app, request("POST", &uri, Some(KEY))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["files_restored"], 1);
    }

    #[tokio::test]
    async fn test_backup_without_live_data_is_404() {
        let h = harness(false);
        let (status, body) = send(&h.app, request("POST", "/backup/backup", Some(KEY))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["detail"].as_str().unwrap().starts_with("Backup failed: "));
    }

    #[tokio::test]
    async fn test_restore_of_incomplete_group_is_422() {
        let h = harness(true);
        let (_, body) = send(&h.app, request("POST", "/backup/backup", Some(KEY))).await;
        let group_id = body["details"]["group_id"].as_str().unwrap().to_string();
        let uploads_id = body["details"]["uploads"]["id"].as_str().unwrap().to_string();
        {
            use crate::storage::RemoteStore;
            h.store.delete_file(&uploads_id).await.unwrap();
        }

        let uri = format!("/backup/restore/{group_id}");
        let (status, body) = send(&h.app, request("POST", &uri, Some(KEY))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].as_str().unwrap().contains("asset archive"));
    }

    #[tokio::test]
    async fn test_restore_of_unknown_group_is_422() {
        let h = harness(true);
        let (status, body) = send(&h.app, request("POST", "/backup/restore/mem-999", Some(KEY))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].as_str().unwrap().contains("mem-999"));
    }

    #[tokio::test]
    async fn test_delete_of_unknown_group_is_404() {
        let h = harness(true);
        let (status, _) = send(&h.app, request("DELETE", "/backup/mem-999", Some(KEY))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
