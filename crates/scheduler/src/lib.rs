//! Concurrent task execution over a pool of browser instances.
//!
//! Tasks go into a bounded [`TaskQueue`]; worker threads in [`TaskScheduler`]
//! pull them, lease an instance from the [`InstancePool`] and run the handler
//! registered for the task type.

pub mod error;
pub mod executor;
pub mod lane;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod queue;
pub mod runtime;

pub use error::{SchedulerError, SchedulerResult};
pub use executor::{StubHandler, TaskHandler};
pub use model::{
    Priority, SchedulerConfig, SchedulerMetrics, Strategy, Task, TaskId, TaskStatus,
};
pub use pool::{InstancePool, Lease, PoolEntry};
pub use queue::TaskQueue;
pub use runtime::{TaskCallback, TaskScheduler};
