use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use once_cell::sync::Lazy;
use prometheus::{core::Collector, opts, IntCounterVec, Registry};
use tracing::error;

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
}

static COUNTERS: Lazy<Counters> = Lazy::new(Counters::default);

lazy_static! {
    static ref SCHEDULER_TASKS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!("cdpctl_scheduler_tasks_total", "Scheduler task transitions"),
        &["event", "type"]
    )
    .unwrap();
}

fn increment(counter: &AtomicU64, event: &str, task_type: &str) {
    counter.fetch_add(1, Ordering::Relaxed);
    SCHEDULER_TASKS_TOTAL
        .with_label_values(&[event, task_type])
        .inc();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register scheduler metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, SCHEDULER_TASKS_TOTAL.clone());
}

pub fn record_submitted(task_type: &str) {
    increment(&COUNTERS.submitted, "submitted", task_type);
}

pub fn record_started(task_type: &str) {
    increment(&COUNTERS.started, "started", task_type);
}

pub fn record_completed(task_type: &str) {
    increment(&COUNTERS.completed, "completed", task_type);
}

pub fn record_failed(task_type: &str) {
    increment(&COUNTERS.failed, "failed", task_type);
}

pub fn record_cancelled(task_type: &str) {
    increment(&COUNTERS.cancelled, "cancelled", task_type);
}

pub fn record_retried(task_type: &str) {
    increment(&COUNTERS.retried, "retried", task_type);
}

#[derive(Clone, Debug, Default)]
pub struct SchedulerMetricsSnapshot {
    pub submitted: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

pub fn snapshot() -> SchedulerMetricsSnapshot {
    SchedulerMetricsSnapshot {
        submitted: COUNTERS.submitted.load(Ordering::Relaxed),
        started: COUNTERS.started.load(Ordering::Relaxed),
        completed: COUNTERS.completed.load(Ordering::Relaxed),
        failed: COUNTERS.failed.load(Ordering::Relaxed),
        cancelled: COUNTERS.cancelled.load(Ordering::Relaxed),
        retried: COUNTERS.retried.load(Ordering::Relaxed),
    }
}
