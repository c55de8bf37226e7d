use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    core::Collector, histogram_opts, HistogramVec, IntCounter, IntCounterVec, Registry,
};
use serde::Serialize;
use tracing::error;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AdapterMetricsSnapshot {
    pub commands: u64,
    pub events: u64,
    pub command_success: u64,
    pub command_failures: u64,
    pub command_latency_total_us: u64,
    pub connects: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub reconnect_give_ups: u64,
    pub bus_stored: u64,
    pub bus_delivered: u64,
    pub bus_evicted: u64,
}

static COMMANDS: AtomicU64 = AtomicU64::new(0);
static EVENTS: AtomicU64 = AtomicU64::new(0);
static COMMAND_SUCCESS: AtomicU64 = AtomicU64::new(0);
static COMMAND_FAILURES: AtomicU64 = AtomicU64::new(0);
static COMMAND_LATENCY_TOTAL_US: AtomicU64 = AtomicU64::new(0);
static CONNECTS: AtomicU64 = AtomicU64::new(0);
static RECONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static RECONNECT_SUCCESSES: AtomicU64 = AtomicU64::new(0);
static RECONNECT_GIVE_UPS: AtomicU64 = AtomicU64::new(0);
static BUS_STORED: AtomicU64 = AtomicU64::new(0);
static BUS_DELIVERED: AtomicU64 = AtomicU64::new(0);
static BUS_EVICTED: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref CDP_COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("cdpctl_cdp_commands_total", "Total CDP commands sent"),
        &["method"]
    )
    .unwrap();
    static ref CDP_COMMAND_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "cdpctl_cdp_command_failures_total",
            "CDP commands that timed out, failed to send or returned an error"
        ),
        &["method"]
    )
    .unwrap();
    static ref CDP_COMMAND_DURATION: HistogramVec = HistogramVec::new(
        histogram_opts!(
            "cdpctl_cdp_command_duration_seconds",
            "Round trip latency of correlated CDP commands",
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]
        ),
        &["method"]
    )
    .unwrap();
    static ref CDP_EVENTS_TOTAL: IntCounter =
        IntCounter::new("cdpctl_cdp_events_total", "Id-less CDP messages seen").unwrap();
    static ref CDP_CONNECTS_TOTAL: IntCounter = IntCounter::new(
        "cdpctl_cdp_connects_total",
        "WebSocket connections established"
    )
    .unwrap();
    static ref CDP_RECONNECTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("cdpctl_cdp_reconnects_total", "Reconnect attempts by outcome"),
        &["outcome"]
    )
    .unwrap();
    static ref CDP_BUS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("cdpctl_cdp_bus_messages_total", "Response bus traffic"),
        &["outcome"]
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register cdp metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, CDP_COMMANDS_TOTAL.clone());
    register(registry, CDP_COMMAND_FAILURES_TOTAL.clone());
    register(registry, CDP_COMMAND_DURATION.clone());
    register(registry, CDP_EVENTS_TOTAL.clone());
    register(registry, CDP_CONNECTS_TOTAL.clone());
    register(registry, CDP_RECONNECTS_TOTAL.clone());
    register(registry, CDP_BUS_TOTAL.clone());
}

pub fn record_command(method: &str) {
    COMMANDS.fetch_add(1, Ordering::Relaxed);
    CDP_COMMANDS_TOTAL.with_label_values(&[method]).inc();
}

pub fn record_event() {
    EVENTS.fetch_add(1, Ordering::Relaxed);
    CDP_EVENTS_TOTAL.inc();
}

pub fn record_command_success(method: &str, duration: Duration) {
    COMMAND_SUCCESS.fetch_add(1, Ordering::Relaxed);
    let micros = duration.as_micros().min(u64::MAX as u128) as u64;
    COMMAND_LATENCY_TOTAL_US.fetch_add(micros, Ordering::Relaxed);
    CDP_COMMAND_DURATION
        .with_label_values(&[method])
        .observe(duration.as_secs_f64());
}

pub fn record_command_failure(method: &str) {
    COMMAND_FAILURES.fetch_add(1, Ordering::Relaxed);
    CDP_COMMAND_FAILURES_TOTAL
        .with_label_values(&[method])
        .inc();
}

pub fn record_connect() {
    CONNECTS.fetch_add(1, Ordering::Relaxed);
    CDP_CONNECTS_TOTAL.inc();
}

pub fn record_reconnect_attempt() {
    RECONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
    CDP_RECONNECTS_TOTAL.with_label_values(&["attempt"]).inc();
}

pub fn record_reconnect_success() {
    RECONNECT_SUCCESSES.fetch_add(1, Ordering::Relaxed);
    CDP_RECONNECTS_TOTAL.with_label_values(&["success"]).inc();
}

pub fn record_reconnect_give_up() {
    RECONNECT_GIVE_UPS.fetch_add(1, Ordering::Relaxed);
    CDP_RECONNECTS_TOTAL.with_label_values(&["give_up"]).inc();
}

pub fn record_bus_store() {
    BUS_STORED.fetch_add(1, Ordering::Relaxed);
    CDP_BUS_TOTAL.with_label_values(&["stored"]).inc();
}

pub fn record_bus_delivery() {
    BUS_DELIVERED.fetch_add(1, Ordering::Relaxed);
    CDP_BUS_TOTAL.with_label_values(&["delivered"]).inc();
}

pub fn record_bus_eviction() {
    BUS_EVICTED.fetch_add(1, Ordering::Relaxed);
    CDP_BUS_TOTAL.with_label_values(&["evicted"]).inc();
}

pub fn snapshot() -> AdapterMetricsSnapshot {
    AdapterMetricsSnapshot {
        commands: COMMANDS.load(Ordering::Relaxed),
        events: EVENTS.load(Ordering::Relaxed),
        command_success: COMMAND_SUCCESS.load(Ordering::Relaxed),
        command_failures: COMMAND_FAILURES.load(Ordering::Relaxed),
        command_latency_total_us: COMMAND_LATENCY_TOTAL_US.load(Ordering::Relaxed),
        connects: CONNECTS.load(Ordering::Relaxed),
        reconnect_attempts: RECONNECT_ATTEMPTS.load(Ordering::Relaxed),
        reconnect_successes: RECONNECT_SUCCESSES.load(Ordering::Relaxed),
        reconnect_give_ups: RECONNECT_GIVE_UPS.load(Ordering::Relaxed),
        bus_stored: BUS_STORED.load(Ordering::Relaxed),
        bus_delivered: BUS_DELIVERED.load(Ordering::Relaxed),
        bus_evicted: BUS_EVICTED.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    for counter in [
        &COMMANDS,
        &EVENTS,
        &COMMAND_SUCCESS,
        &COMMAND_FAILURES,
        &COMMAND_LATENCY_TOTAL_US,
        &CONNECTS,
        &RECONNECT_ATTEMPTS,
        &RECONNECT_SUCCESSES,
        &RECONNECT_GIVE_UPS,
        &BUS_STORED,
        &BUS_DELIVERED,
        &BUS_EVICTED,
    ] {
        counter.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Other tests in this crate bump the same counters concurrently, so
    // only lower bounds are asserted.
    #[test]
    fn records_success_and_failure_metrics() {
        let before = snapshot();
        record_command("Page.navigate");
        record_command_success("Page.navigate", Duration::from_micros(150));
        record_command_failure("Page.navigate");
        record_reconnect_give_up();
        let after = snapshot();
        assert!(after.commands > before.commands);
        assert!(after.command_success > before.command_success);
        assert!(after.command_failures > before.command_failures);
        assert!(after.command_latency_total_us >= before.command_latency_total_us + 150);
        assert!(after.reconnect_give_ups > before.reconnect_give_ups);
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = Registry::new();
        register_metrics(&registry);
        register_metrics(&registry);
        record_connect();
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|family| family.get_name() == "cdpctl_cdp_connects_total"));
    }
}
