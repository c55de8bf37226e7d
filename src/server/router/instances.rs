use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use cdpctl_registry::{ChromeInstance, InstanceConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::server::ServeState;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct KillQuery {
    #[serde(default)]
    force: bool,
}

pub(crate) fn router() -> Router<ServeState> {
    Router::new()
        .route("/instances", get(list_handler).post(launch_handler))
        .route(
            "/instances/:instance_id",
            get(get_handler).delete(kill_handler),
        )
}

async fn list_handler(State(state): State<ServeState>) -> Json<Vec<ChromeInstance>> {
    Json(state.context().registry().list())
}

/// An empty body launches with the registry defaults.
async fn launch_handler(
    State(state): State<ServeState>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<ChromeInstance>)> {
    let config = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        let config: InstanceConfig = serde_json::from_slice(&body)
            .map_err(|err| AppError::BadRequest(format!("invalid instance config: {err}")))?;
        Some(config)
    };
    let instance = state
        .blocking(move |ctx| {
            let instance = ctx.launch_instance(config)?;
            ctx.start_health_monitor()?;
            Ok(instance)
        })
        .await?;
    info!(
        target: "cdpctl-http",
        instance = instance.instance_id,
        port = instance.debug_port,
        "instance launched"
    );
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn get_handler(
    State(state): State<ServeState>,
    Path(instance_id): Path<u32>,
) -> AppResult<Json<ChromeInstance>> {
    Ok(Json(state.context().registry().get(instance_id)?))
}

async fn kill_handler(
    State(state): State<ServeState>,
    Path(instance_id): Path<u32>,
    Query(query): Query<KillQuery>,
) -> AppResult<Json<Value>> {
    let force = query.force;
    state
        .blocking(move |ctx| Ok(ctx.kill_instance(instance_id, force)?))
        .await?;
    Ok(Json(json!({ "killed": instance_id, "force": force })))
}
