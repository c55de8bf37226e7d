//! Worker threads pulling tasks off the queue and running them on pooled instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::{StubHandler, TaskHandler};
use crate::metrics;
use crate::model::{Priority, SchedulerConfig, SchedulerMetrics, Task, TaskId, TaskStatus};
use crate::pool::{InstancePool, Lease};
use crate::queue::TaskQueue;

pub type TaskCallback = Box<dyn FnOnce(&Task) + Send>;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct TaskEntry {
    task: Task,
    callback: Option<TaskCallback>,
}

#[derive(Default)]
struct Aggregate {
    total: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    retried: u64,
    response_total_ms: f64,
    responses: u64,
}

struct Shared {
    config: SchedulerConfig,
    queue: TaskQueue,
    pool: Arc<InstancePool>,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    default_handler: Arc<dyn TaskHandler>,
    aggregate: Mutex<Aggregate>,
    next_id: AtomicU64,
    started_at: Instant,
}

/// Fixed set of worker threads over a bounded queue and an [`InstancePool`].
pub struct TaskScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, pool: Arc<InstancePool>) -> SchedulerResult<Self> {
        if pool.is_empty() {
            return Err(SchedulerError::PoolEmpty);
        }
        let workers = config.workers.max(1);
        let shared = Arc::new(Shared {
            queue: TaskQueue::new(config.queue_capacity),
            config,
            pool,
            tasks: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            default_handler: Arc::new(StubHandler),
            aggregate: Mutex::new(Aggregate::default()),
            next_id: AtomicU64::new(1),
            started_at: Instant::now(),
        });

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("cdp-worker-{index}"))
                .spawn(move || worker_loop(index, shared))
                .map_err(|err| SchedulerError::Handler(format!("spawn worker: {err}")))?;
            handles.push(handle);
        }
        info!(
            target: "cdp-scheduler",
            workers,
            instances = shared.pool.len(),
            strategy = ?shared.pool.strategy(),
            "task scheduler started"
        );
        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.shared.pool
    }

    pub fn register_handler(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.shared.handlers.write().insert(task_type.into(), handler);
    }

    /// Enqueue a task. Blocks while the queue is full.
    pub fn submit_task(
        &self,
        task_type: impl Into<String>,
        data: Value,
        priority: Priority,
    ) -> SchedulerResult<TaskId> {
        self.submit(task_type.into(), data, priority, None)
    }

    pub fn submit_with_callback(
        &self,
        task_type: impl Into<String>,
        data: Value,
        priority: Priority,
        callback: TaskCallback,
    ) -> SchedulerResult<TaskId> {
        self.submit(task_type.into(), data, priority, Some(callback))
    }

    fn submit(
        &self,
        task_type: String,
        data: Value,
        priority: Priority,
        callback: Option<TaskCallback>,
    ) -> SchedulerResult<TaskId> {
        if self.shared.queue.is_closed() {
            return Err(SchedulerError::ShutDown);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Task::new(id, task_type, data, priority);
        metrics::record_submitted(&task.task_type);
        self.shared
            .tasks
            .lock()
            .insert(id, TaskEntry { task, callback });
        self.shared.aggregate.lock().total += 1;

        // Mark queued before the push so a fast worker never sees Pending.
        self.set_status(id, TaskStatus::Queued);
        if let Err(err) = self.shared.queue.push(id, priority) {
            self.shared.tasks.lock().remove(&id);
            self.shared.aggregate.lock().total -= 1;
            return Err(err);
        }
        debug!(target: "cdp-scheduler", id, ?priority, "task queued");
        Ok(id)
    }

    fn set_status(&self, id: TaskId, status: TaskStatus) {
        if let Some(entry) = self.shared.tasks.lock().get_mut(&id) {
            entry.task.status = status;
        }
    }

    pub fn get_task_status(&self, id: TaskId) -> SchedulerResult<TaskStatus> {
        self.shared
            .tasks
            .lock()
            .get(&id)
            .map(|entry| entry.task.status)
            .ok_or(SchedulerError::TaskNotFound(id))
    }

    pub fn get_task(&self, id: TaskId) -> SchedulerResult<Task> {
        self.shared
            .tasks
            .lock()
            .get(&id)
            .map(|entry| entry.task.clone())
            .ok_or(SchedulerError::TaskNotFound(id))
    }

    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .shared
            .tasks
            .lock()
            .values()
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    /// Cancel a task that has not started. Running tasks are never preempted.
    pub fn cancel_task(&self, id: TaskId) -> SchedulerResult<()> {
        let (task, callback) = {
            let mut tasks = self.shared.tasks.lock();
            let entry = tasks.get_mut(&id).ok_or(SchedulerError::TaskNotFound(id))?;
            match entry.task.status {
                TaskStatus::Pending | TaskStatus::Queued => {}
                TaskStatus::Running | TaskStatus::Retrying => {
                    return Err(SchedulerError::AlreadyRunning(id));
                }
                status => return Err(SchedulerError::AlreadyFinished(id, status)),
            }
            entry.task.status = TaskStatus::Cancelled;
            entry.task.finished_at = Some(Utc::now());
            (entry.task.clone(), entry.callback.take())
        };
        self.shared.queue.remove(id);
        self.shared.aggregate.lock().cancelled += 1;
        metrics::record_cancelled(&task.task_type);
        info!(target: "cdp-scheduler", id, "task cancelled");
        if let Some(callback) = callback {
            callback(&task);
        }
        Ok(())
    }

    /// Re-queue a failed task by hand, within the retry budget.
    pub fn retry_task(&self, id: TaskId) -> SchedulerResult<()> {
        let priority = {
            let mut tasks = self.shared.tasks.lock();
            let entry = tasks.get_mut(&id).ok_or(SchedulerError::TaskNotFound(id))?;
            if entry.task.status != TaskStatus::Failed {
                return Err(SchedulerError::AlreadyFinished(id, entry.task.status));
            }
            if entry.task.retry_count >= self.shared.config.max_retries {
                return Err(SchedulerError::MaxRetriesExceeded(
                    id,
                    self.shared.config.max_retries,
                ));
            }
            entry.task.retry_count += 1;
            entry.task.status = TaskStatus::Queued;
            entry.task.error = None;
            entry.task.finished_at = None;
            entry.task.priority
        };
        {
            let mut aggregate = self.shared.aggregate.lock();
            aggregate.failed = aggregate.failed.saturating_sub(1);
            aggregate.retried += 1;
        }
        if let Err(err) = self.shared.queue.try_push(id, priority) {
            fail_requeue(&self.shared, id, &err);
            return Err(err);
        }
        Ok(())
    }

    /// Poll until no task is pending, queued, running or retrying.
    /// Returns false if `timeout` elapsed first.
    pub fn wait_for_all_tasks(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let busy = self
                .shared
                .tasks
                .lock()
                .values()
                .any(|entry| !entry.task.status.is_final());
            if !busy {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let aggregate = self.shared.aggregate.lock();
        let elapsed = self.shared.started_at.elapsed().as_secs_f64();
        SchedulerMetrics {
            total: aggregate.total,
            completed: aggregate.completed,
            failed: aggregate.failed,
            cancelled: aggregate.cancelled,
            retried: aggregate.retried,
            average_response_ms: if aggregate.responses == 0 {
                0.0
            } else {
                aggregate.response_total_ms / aggregate.responses as f64
            },
            throughput_per_sec: if elapsed > 0.0 {
                (aggregate.completed + aggregate.failed) as f64 / elapsed
            } else {
                0.0
            },
        }
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stop accepting work, wake idle workers and join them. Tasks already
    /// running finish first; anything that never started ends `Cancelled`.
    pub fn shutdown(&self) {
        self.shared.queue.close();
        self.shared.pool.close();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let stopping = !handles.is_empty();
        for handle in handles {
            let _ = handle.join();
        }
        let cancelled = cancel_unstarted(&self.shared);
        if stopping {
            info!(target: "cdp-scheduler", cancelled, "task scheduler stopped");
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, shared: Arc<Shared>) {
    debug!(target: "cdp-scheduler", worker = index, "worker started");
    while let Some(id) = shared.queue.pop() {
        if !is_queued(&shared, id) {
            continue;
        }
        let Some(lease) = shared.pool.acquire(id) else {
            break;
        };
        let Some(task) = start_task(&shared, id, &lease) else {
            shared.pool.give_back(lease);
            continue;
        };
        metrics::record_started(&task.task_type);

        let handler = shared
            .handlers
            .read()
            .get(&task.task_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&shared.default_handler));
        let started = Instant::now();
        let outcome = handler.execute(&task, &lease);
        let elapsed = started.elapsed();
        shared.pool.release(lease, outcome.is_ok(), elapsed);
        finish_task(&shared, id, outcome, elapsed);
    }
    debug!(target: "cdp-scheduler", worker = index, "worker stopped");
}

fn is_queued(shared: &Shared, id: TaskId) -> bool {
    shared
        .tasks
        .lock()
        .get(&id)
        .map(|entry| entry.task.status == TaskStatus::Queued)
        .unwrap_or(false)
}

/// Flip a queued task to running. `None` if it was cancelled meanwhile.
fn start_task(shared: &Shared, id: TaskId, lease: &Lease) -> Option<Task> {
    let mut tasks = shared.tasks.lock();
    let entry = tasks.get_mut(&id)?;
    if entry.task.status != TaskStatus::Queued {
        return None;
    }
    entry.task.status = TaskStatus::Running;
    entry.task.instance_id = Some(lease.instance_id);
    entry.task.started_at = Some(Utc::now());
    debug!(
        target: "cdp-scheduler",
        id,
        instance = lease.instance_id,
        "task running"
    );
    Some(entry.task.clone())
}

fn finish_task(
    shared: &Shared,
    id: TaskId,
    outcome: Result<Value, SchedulerError>,
    elapsed: Duration,
) {
    let mut requeue = None;
    let finished = {
        let mut tasks = shared.tasks.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return;
        };
        let task = &mut entry.task;
        match outcome {
            Ok(result) => {
                task.status = TaskStatus::Completed;
                task.result = Some(result);
                task.error = None;
            }
            Err(err) if task.retry_count < shared.config.max_retries => {
                task.retry_count += 1;
                task.status = TaskStatus::Retrying;
                task.error = Some(err.to_string());
                warn!(
                    target: "cdp-scheduler",
                    id,
                    attempt = task.retry_count,
                    %err,
                    "task failed, retrying"
                );
                requeue = Some((task.priority, task.task_type.clone()));
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                task.error = Some(err.to_string());
                warn!(target: "cdp-scheduler", id, %err, "task failed");
            }
        }
        if task.status.is_final() {
            task.finished_at = Some(Utc::now());
            Some((task.clone(), entry.callback.take()))
        } else {
            None
        }
    };

    {
        let mut aggregate = shared.aggregate.lock();
        aggregate.response_total_ms += elapsed.as_secs_f64() * 1000.0;
        aggregate.responses += 1;
        match finished.as_ref().map(|(task, _)| task.status) {
            Some(TaskStatus::Completed) => aggregate.completed += 1,
            Some(TaskStatus::Failed) => aggregate.failed += 1,
            _ => aggregate.retried += 1,
        }
    }

    if let Some((priority, task_type)) = requeue {
        metrics::record_retried(&task_type);
        let pushed = {
            let mut tasks = shared.tasks.lock();
            if let Some(entry) = tasks.get_mut(&id) {
                entry.task.status = TaskStatus::Queued;
            }
            drop(tasks);
            shared.queue.try_push(id, priority)
        };
        if let Err(err) = pushed {
            fail_requeue(shared, id, &err);
        }
        return;
    }

    if let Some((task, callback)) = finished {
        match task.status {
            TaskStatus::Completed => metrics::record_completed(&task.task_type),
            _ => metrics::record_failed(&task.task_type),
        }
        if let Some(callback) = callback {
            callback(&task);
        }
    }
}

fn fail_requeue(shared: &Shared, id: TaskId, err: &SchedulerError) {
    let finished = {
        let mut tasks = shared.tasks.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return;
        };
        entry.task.status = TaskStatus::Failed;
        entry.task.error = Some(format!("retry not queued: {err}"));
        entry.task.finished_at = Some(Utc::now());
        (entry.task.clone(), entry.callback.take())
    };
    shared.aggregate.lock().failed += 1;
    metrics::record_failed(&finished.0.task_type);
    warn!(target: "cdp-scheduler", id, %err, "task retry could not be queued");
    if let (task, Some(callback)) = finished {
        callback(&task);
    }
}

fn cancel_unstarted(shared: &Shared) -> usize {
    let cancelled: Vec<(Task, Option<TaskCallback>)> = {
        let mut tasks = shared.tasks.lock();
        tasks
            .values_mut()
            .filter(|entry| {
                matches!(
                    entry.task.status,
                    TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Retrying
                )
            })
            .map(|entry| {
                entry.task.status = TaskStatus::Cancelled;
                entry.task.error = Some("scheduler shut down".to_string());
                entry.task.finished_at = Some(Utc::now());
                (entry.task.clone(), entry.callback.take())
            })
            .collect()
    };
    let count = cancelled.len();
    if count == 0 {
        return 0;
    }
    shared.aggregate.lock().cancelled += count as u64;
    for (task, callback) in cancelled {
        shared.queue.remove(task.id);
        metrics::record_cancelled(&task.task_type);
        if let Some(callback) = callback {
            callback(&task);
        }
    }
    count
}
