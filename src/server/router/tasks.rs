use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use cdpctl_scheduler::{Priority, Task, TaskId};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::AppResult;
use crate::server::ServeState;
use crate::task_handler::CDP_TASK_TYPE;

#[derive(Debug, Deserialize)]
pub(crate) struct SubmitRequest {
    #[serde(rename = "type", default = "default_task_type")]
    task_type: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    priority: Priority,
}

fn default_task_type() -> String {
    CDP_TASK_TYPE.to_string()
}

pub(crate) fn router() -> Router<ServeState> {
    Router::new()
        .route("/tasks", get(list_handler).post(submit_handler))
        .route("/tasks/:task_id", get(get_handler).delete(cancel_handler))
}

/// The scheduler starts on first submission over whatever instances are running.
async fn submit_handler(
    State(state): State<ServeState>,
    Json(request): Json<SubmitRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let task_id = state
        .blocking(move |ctx| {
            let scheduler = ctx.start_scheduler()?;
            ctx.sync_pool();
            Ok(scheduler.submit_task(request.task_type, request.data, request.priority)?)
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))))
}

async fn list_handler(State(state): State<ServeState>) -> Json<Vec<Task>> {
    let tasks = state
        .context()
        .scheduler()
        .map(|scheduler| scheduler.tasks())
        .unwrap_or_default();
    Json(tasks)
}

async fn get_handler(
    State(state): State<ServeState>,
    Path(task_id): Path<TaskId>,
) -> AppResult<Json<Task>> {
    let scheduler = state
        .context()
        .scheduler()
        .ok_or(cdpctl_scheduler::SchedulerError::TaskNotFound(task_id))?;
    Ok(Json(scheduler.get_task(task_id)?))
}

async fn cancel_handler(
    State(state): State<ServeState>,
    Path(task_id): Path<TaskId>,
) -> AppResult<Json<Value>> {
    let scheduler = state
        .context()
        .scheduler()
        .ok_or(cdpctl_scheduler::SchedulerError::TaskNotFound(task_id))?;
    scheduler.cancel_task(task_id)?;
    Ok(Json(json!({ "cancelled": task_id })))
}
