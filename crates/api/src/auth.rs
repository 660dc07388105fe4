use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::AppState;

/// Middleware enforcing the shared-secret header on all protected routes.
pub async fn require_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let provided = headers.get("X-API-KEY").and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if state.api_keys.iter().any(|k| k == key) => next.run(request).await,
        _ => {
            warn!("unauthorized control API request");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "unauthorized"})),
            )
                .into_response()
        }
    }
}
