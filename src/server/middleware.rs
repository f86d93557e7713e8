/// API key check for the backup routes.
///
/// Handlers take [`ApiKey`] as an extractor; requests without the
/// configured key in `x-api-key` are rejected with 403 before the
/// handler body runs.
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use tracing::warn;

use super::routes::ErrorResponse;
use super::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Marker proving the request carried a valid API key.
#[derive(Debug, Clone, Copy)]
pub struct ApiKey;

impl FromRequestParts<Arc<AppState>> for ApiKey {
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());

        match presented {
            Some(key) if key == state.config.api_key => Ok(ApiKey),
            _ => {
                warn!(path = %parts.uri.path(), "Rejected request with missing or invalid API key");
                Err((
                    StatusCode::FORBIDDEN,
                    Json(ErrorResponse {
                        detail: "Invalid API Key".into(),
                    }),
                ))
            }
        }
    }
}
