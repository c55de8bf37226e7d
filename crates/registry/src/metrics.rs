use lazy_static::lazy_static;
use prometheus::{core::Collector, opts, IntCounter, IntCounterVec, IntGauge, Registry};
use tracing::error;

lazy_static! {
    static ref REGISTRY_INSTANCES_LIVE: IntGauge = IntGauge::new(
        "cdpctl_registry_instances_live",
        "Chrome instances currently held by the registry"
    )
    .unwrap();
    static ref REGISTRY_LAUNCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!("cdpctl_registry_launches_total", "Instance launches by outcome"),
        &["outcome"]
    )
    .unwrap();
    static ref REGISTRY_KILLS_TOTAL: IntCounter = IntCounter::new(
        "cdpctl_registry_kills_total",
        "Instances stopped and removed from the registry"
    )
    .unwrap();
    static ref REGISTRY_HEALTH_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "cdpctl_registry_health_failures_total",
            "Failed health checks grouped by reason"
        ),
        &["reason"]
    )
    .unwrap();
    static ref REGISTRY_RESTARTS_TOTAL: IntCounter = IntCounter::new(
        "cdpctl_registry_restarts_total",
        "Instances restarted after a failed health check"
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register registry metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, REGISTRY_INSTANCES_LIVE.clone());
    register(registry, REGISTRY_LAUNCHES_TOTAL.clone());
    register(registry, REGISTRY_KILLS_TOTAL.clone());
    register(registry, REGISTRY_HEALTH_FAILURES_TOTAL.clone());
    register(registry, REGISTRY_RESTARTS_TOTAL.clone());
}

pub fn set_live_instances(count: usize) {
    REGISTRY_INSTANCES_LIVE.set(count as i64);
}

pub fn record_launch(ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    REGISTRY_LAUNCHES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_kill() {
    REGISTRY_KILLS_TOTAL.inc();
}

pub fn record_health_failure(reason: &str) {
    REGISTRY_HEALTH_FAILURES_TOTAL
        .with_label_values(&[reason])
        .inc();
}

pub fn record_restart() {
    REGISTRY_RESTARTS_TOTAL.inc();
}
