use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::server::ServeState;

#[derive(Debug, Deserialize)]
pub(crate) struct CdpRequest {
    method: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    timeout_ms: i64,
}

pub(crate) fn router() -> Router<ServeState> {
    Router::new().route("/api/cdp", post(call_handler))
}

/// The reply goes back verbatim. A CDP `error` is still a 200: the browser
/// answered. Only transport and correlation failures map to 5xx.
async fn call_handler(
    State(state): State<ServeState>,
    Json(request): Json<CdpRequest>,
) -> AppResult<Json<Value>> {
    if request.method.trim().is_empty() {
        return Err(AppError::BadRequest("method must not be empty".into()));
    }
    debug!(target: "cdpctl-http", method = %request.method, "cdp call");
    let reply = state
        .blocking(move |ctx| {
            ctx.call(&request.method, request.params, request.timeout_ms)
                .map_err(AppError::from)
        })
        .await?;
    Ok(Json(reply.into_value()))
}
