use axum::{extract::State, http::Method, response::Response, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::errors::AppResult;
use crate::metrics;

mod cdp;
mod instances;
mod tasks;

use super::state::ServeState;

pub fn build_router(state: ServeState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .merge(cdp::router())
        .merge(instances::router())
        .merge(tasks::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

async fn health_handler(State(state): State<ServeState>) -> Json<Value> {
    let ctx = state.context();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.uptime_secs(),
        "chrome_port": ctx.config().chrome.port,
        "instances": ctx.registry().stats(),
    }))
}

async fn stats_handler(State(state): State<ServeState>) -> AppResult<Json<Value>> {
    let stats = state.blocking(|ctx| Ok(ctx.stats())).await?;
    Ok(Json(json!(stats)))
}

async fn metrics_handler() -> Response {
    metrics::register_metrics();
    metrics::render(metrics::global_registry())
}
