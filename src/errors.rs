//! Errors surfaced over the HTTP control API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cdp_adapter::{AdapterError, AdapterErrorKind};
use cdpctl_registry::RegistryError;
use cdpctl_scheduler::SchedulerError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Adapter(err) => match err.kind {
                AdapterErrorKind::ReplyTimeout => StatusCode::GATEWAY_TIMEOUT,
                AdapterErrorKind::DomainError => StatusCode::UNPROCESSABLE_ENTITY,
                AdapterErrorKind::ExecutableNotFound | AdapterErrorKind::LaunchFailed => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                AdapterErrorKind::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
                AdapterErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_GATEWAY,
            },
            AppError::Registry(err) => match err {
                RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
                RegistryError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                RegistryError::LimitReached(_) | RegistryError::Busy(_) => StatusCode::CONFLICT,
                RegistryError::LaunchFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Scheduler(err) => match err {
                SchedulerError::TaskNotFound(_) => StatusCode::NOT_FOUND,
                SchedulerError::QueueFull
                | SchedulerError::PoolEmpty
                | SchedulerError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
                SchedulerError::AlreadyRunning(_)
                | SchedulerError::AlreadyFinished(..)
                | SchedulerError::MaxRetriesExceeded(..) => StatusCode::CONFLICT,
                SchedulerError::Handler(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> String {
        match self {
            AppError::Adapter(err) => format!("{:?}", err.kind),
            AppError::Registry(_) => "Registry".to_string(),
            AppError::Scheduler(_) => "Scheduler".to_string(),
            AppError::BadRequest(_) => "BadRequest".to_string(),
            AppError::Internal(_) => "Internal".to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("blocking task failed: {err}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_map_to_gateway_statuses() {
        let timeout = AppError::from(AdapterError::new(AdapterErrorKind::ReplyTimeout));
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        let closed = AppError::from(AdapterError::new(AdapterErrorKind::ConnectionClosed));
        assert_eq!(closed.status(), StatusCode::BAD_GATEWAY);
        let refused = AppError::from(AdapterError::new(AdapterErrorKind::ReconnectExhausted));
        assert_eq!(refused.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn lifecycle_failures_map_to_client_statuses() {
        assert_eq!(
            AppError::from(RegistryError::NotFound(7)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(RegistryError::LimitReached(32)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(RegistryError::Busy(4)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(SchedulerError::AlreadyRunning(3)).status(),
            StatusCode::CONFLICT
        );
    }
}
