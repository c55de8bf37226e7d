use thiserror::Error;

use crate::model::{TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task queue is full")]
    QueueFull,
    #[error("instance pool is empty")]
    PoolEmpty,
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error("task {0} is already running, cannot cancel")]
    AlreadyRunning(TaskId),
    #[error("task {0} already finished as {1}")]
    AlreadyFinished(TaskId, TaskStatus),
    #[error("task {0} exhausted its {1} retries")]
    MaxRetriesExceeded(TaskId, u32),
    #[error("scheduler is shut down")]
    ShutDown,
    #[error("task handler failed: {0}")]
    Handler(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
