use serde_json::{json, Value};

use crate::error::SchedulerError;
use crate::model::Task;
use crate::pool::Lease;

/// Runs one task type against a leased instance.
pub trait TaskHandler: Send + Sync {
    fn execute(&self, task: &Task, lease: &Lease) -> Result<Value, SchedulerError>;
}

/// Fallback used when no handler is registered for a task type.
#[derive(Clone, Copy, Default, Debug)]
pub struct StubHandler;

impl TaskHandler for StubHandler {
    fn execute(&self, task: &Task, _lease: &Lease) -> Result<Value, SchedulerError> {
        Ok(json!({ "status": "ok", "type": task.task_type }))
    }
}

impl<F> TaskHandler for F
where
    F: Fn(&Task, &Lease) -> Result<Value, SchedulerError> + Send + Sync,
{
    fn execute(&self, task: &Task, lease: &Lease) -> Result<Value, SchedulerError> {
        self(task, lease)
    }
}
