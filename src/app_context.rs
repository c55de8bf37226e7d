//! Shared application state.
//!
//! [`AppContext`] is built once per process from the loaded [`AppConfig`] and
//! handed to CLI commands and HTTP handlers. It owns the single-browser
//! supervisor and its lazily opened connection, the multi-instance registry,
//! and (once started) the task scheduler over registry instances.

use std::sync::Arc;

use cdp_adapter::config::Endpoint;
use cdp_adapter::metrics::{self as cdp_metrics, AdapterMetricsSnapshot};
use cdp_adapter::{
    create_new_page, discover_browser_target, list_targets, AdapterResult, ChromeSupervisor,
    CommandIds, Dispatcher, EnsureOutcome, Reply, ResponseBus,
};
use cdpctl_registry::{
    ChromeInstance, ChromeRegistry, ChromeSpawner, HealthCallback, HealthFailure, HealthMonitor,
    InstanceConfig, ProcessSpawner, RecoveryCallback, RegistryResult, RegistryStats,
};
use cdpctl_scheduler::{InstancePool, SchedulerMetrics, SchedulerResult, TaskScheduler};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::task_handler::{default_target, CdpTaskHandler, CDP_TASK_TYPE};

#[derive(Clone, Debug, Serialize)]
pub struct ContextStats {
    pub chrome_port: u16,
    pub connected: bool,
    pub registry: RegistryStats,
    pub scheduler: Option<SchedulerMetrics>,
    pub adapter: AdapterMetricsSnapshot,
}

pub struct AppContext {
    config: AppConfig,
    ids: Arc<CommandIds>,
    bus: Arc<ResponseBus>,
    supervisor: ChromeSupervisor,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    registry: Arc<ChromeRegistry>,
    health: Mutex<Option<HealthMonitor>>,
    scheduler: Mutex<Option<Arc<TaskScheduler>>>,
    task_handler: Arc<CdpTaskHandler>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let spawner = Arc::new(ChromeSpawner::new(config.chrome.executable.clone()));
        Self::with_spawner(config, spawner)
    }

    /// Same as [`AppContext::new`] with a custom process launcher for registry instances.
    pub fn with_spawner(config: AppConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let supervisor = ChromeSupervisor::new(config.chrome.clone(), config.transport.clone());
        let registry = Arc::new(ChromeRegistry::new(config.registry.clone(), spawner));
        let task_handler = Arc::new(CdpTaskHandler::new(
            config.chrome.host.clone(),
            config.transport.clone(),
        ));
        Self {
            config,
            ids: Arc::new(CommandIds::new()),
            bus: Arc::new(ResponseBus::new()),
            supervisor,
            dispatcher: Mutex::new(None),
            registry,
            health: Mutex::new(None),
            scheduler: Mutex::new(None),
            task_handler,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn endpoint(&self) -> Endpoint {
        self.config.chrome.endpoint()
    }

    pub fn supervisor(&self) -> &ChromeSupervisor {
        &self.supervisor
    }

    pub fn registry(&self) -> &Arc<ChromeRegistry> {
        &self.registry
    }

    pub fn ids(&self) -> &Arc<CommandIds> {
        &self.ids
    }

    /// Make sure a browser listens on the configured port, launching it when allowed.
    pub fn ensure_browser(&self, relaunch: bool) -> AdapterResult<EnsureOutcome> {
        let outcome = self.supervisor.ensure_running(relaunch, &self.ids)?;
        if matches!(outcome, EnsureOutcome::Relaunched { .. }) {
            self.drop_connection();
        }
        Ok(outcome)
    }

    /// The page connection commands go through, opened on first use.
    pub fn dispatcher(&self) -> AdapterResult<Arc<Dispatcher>> {
        let mut slot = self.dispatcher.lock();
        if let Some(dispatcher) = slot.as_ref() {
            return Ok(Arc::clone(dispatcher));
        }

        self.supervisor.ensure_running(false, &self.ids)?;
        let endpoint = self.endpoint();
        let target = default_target(&endpoint, &self.config.transport)?;
        let dispatcher = Arc::new(Dispatcher::connect(
            endpoint,
            target.clone(),
            self.config.transport.clone(),
            Arc::clone(&self.ids),
            Arc::clone(&self.bus),
        )?);
        info!(port = self.config.chrome.port, %target, "connected to Chrome");
        *slot = Some(Arc::clone(&dispatcher));
        Ok(dispatcher)
    }

    pub fn drop_connection(&self) {
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.close();
        }
        self.bus.clear();
    }

    /// Send and wait. A CDP `error` in the reply is not an `Err`.
    pub fn call(&self, method: &str, params: Option<Value>, timeout_ms: i64) -> AdapterResult<Reply> {
        self.dispatcher()?.call_cmd(method, params, timeout_ms)
    }

    /// Fire and forget; returns the command id.
    pub fn send(&self, method: &str, params: Option<Value>) -> AdapterResult<u64> {
        self.dispatcher()?.send_cmd(method, params)
    }

    pub fn targets(&self) -> AdapterResult<Vec<Value>> {
        self.supervisor.ensure_running(false, &self.ids)?;
        list_targets(&self.endpoint(), &self.config.transport)
    }

    /// Open `about:blank` through a short-lived browser-level connection.
    pub fn new_page(&self) -> AdapterResult<String> {
        self.supervisor.ensure_running(false, &self.ids)?;
        let endpoint = self.endpoint();
        let target = discover_browser_target(&endpoint, &self.config.transport)?;
        let browser = Dispatcher::connect(
            endpoint,
            target,
            self.config.transport.clone(),
            Arc::clone(&self.ids),
            Arc::new(ResponseBus::new()),
        )?;
        let page = create_new_page(&browser);
        browser.close();
        page
    }

    pub fn launch_instance(&self, config: Option<InstanceConfig>) -> RegistryResult<ChromeInstance> {
        let config = config.unwrap_or_else(|| self.config.registry.instance_defaults());
        let instance = self.registry.launch(config)?;
        if let Some(scheduler) = self.scheduler() {
            scheduler
                .pool()
                .add_instance(instance.instance_id, instance.debug_port);
        }
        Ok(instance)
    }

    /// A leased instance leaves the pool once its running task hands it back.
    pub fn kill_instance(&self, id: u32, force: bool) -> RegistryResult<()> {
        if let Some(scheduler) = self.scheduler() {
            scheduler.pool().remove_instance(id);
        }
        self.task_handler.forget_instance(id);
        self.registry.kill(id, force)
    }

    pub fn start_health_monitor(&self) -> RegistryResult<()> {
        let mut slot = self.health.lock();
        if slot.is_none() {
            let interval = self.config.registry.health_check_interval;
            *slot = Some(HealthMonitor::start(Arc::clone(&self.registry), interval)?);
        }
        Ok(())
    }

    /// Start a scheduler over every running registry instance.
    ///
    /// Health failures reported by the registry take the instance out of
    /// rotation and a successful restart puts it back.
    pub fn start_scheduler(&self) -> SchedulerResult<Arc<TaskScheduler>> {
        let mut slot = self.scheduler.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }

        let running: Vec<ChromeInstance> = self
            .registry
            .list()
            .into_iter()
            .filter(ChromeInstance::is_running)
            .collect();
        let pool = Arc::new(InstancePool::from_instances(
            self.config.scheduler.strategy,
            running.iter(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            self.config.scheduler.clone(),
            Arc::clone(&pool),
        )?);
        scheduler.register_handler(CDP_TASK_TYPE, self.task_handler.clone());

        let health_pool = Arc::clone(&pool);
        let health_handler = Arc::clone(&self.task_handler);
        let on_failure: HealthCallback = Arc::new(move |instance: &ChromeInstance, failure: &HealthFailure| {
            warn!(instance = instance.instance_id, %failure, "removing instance from rotation");
            health_pool.mark_unhealthy(instance.instance_id);
            health_handler.forget_instance(instance.instance_id);
        });
        self.registry.set_health_callback(on_failure);

        let recovery_pool = Arc::clone(&pool);
        let on_recovery: RecoveryCallback = Arc::new(move |instance: &ChromeInstance| {
            info!(instance = instance.instance_id, restarts = instance.restart_count, "instance back in rotation");
            recovery_pool.add_instance(instance.instance_id, instance.debug_port);
            recovery_pool.mark_healthy(instance.instance_id);
        });
        self.registry.set_recovery_callback(on_recovery);

        *slot = Some(Arc::clone(&scheduler));
        Ok(scheduler)
    }

    pub fn scheduler(&self) -> Option<Arc<TaskScheduler>> {
        self.scheduler.lock().clone()
    }

    /// Align pool health with the registry: running instances rejoin, the rest leave rotation.
    pub fn sync_pool(&self) {
        let Some(scheduler) = self.scheduler() else {
            return;
        };
        let pool = scheduler.pool();
        for instance in self.registry.list() {
            if instance.is_running() {
                pool.add_instance(instance.instance_id, instance.debug_port);
                pool.mark_healthy(instance.instance_id);
            } else {
                pool.mark_unhealthy(instance.instance_id);
            }
        }
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            chrome_port: self.config.chrome.port,
            connected: self
                .dispatcher
                .lock()
                .as_ref()
                .map(|dispatcher| dispatcher.is_connected())
                .unwrap_or(false),
            registry: self.registry.stats(),
            scheduler: self.scheduler().map(|scheduler| scheduler.metrics()),
            adapter: cdp_metrics::snapshot(),
        }
    }

    /// Stop background work and kill every registry instance.
    pub fn shutdown(&self) {
        if let Some(monitor) = self.health.lock().take() {
            monitor.stop();
        }
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }
        self.registry.clear_health_callback();
        self.registry.clear_recovery_callback();
        self.task_handler.forget_instances();
        self.drop_connection();
        let killed = self.registry.emergency_cleanup();
        if killed > 0 {
            info!(killed, "registry instances stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_adapter::testing::FakeChrome;
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn context_for(chrome: &FakeChrome) -> AppContext {
        let mut config = AppConfig::default();
        config.chrome.port = chrome.port();
        config.chrome.auto_launch = false;
        AppContext::new(config)
    }

    #[test]
    fn call_reuses_one_connection() {
        let chrome = FakeChrome::start();
        let ctx = context_for(&chrome);

        let reply = ctx.call("Page.navigate", Some(json!({"url": "about:blank"})), 0).unwrap();
        assert_eq!(reply.get_str("result.method"), Some("Page.navigate"));
        let reply = ctx.call("Test.error", None, 0).unwrap();
        assert_eq!(reply.domain_error().unwrap().message, "boom");
        assert!(ctx.send("Page.reload", None).unwrap() > 0);

        assert_eq!(chrome.connections(), 1);
        assert!(ctx.stats().connected);
    }

    #[test]
    fn new_page_uses_browser_target() {
        let chrome = FakeChrome::start();
        let ctx = context_for(&chrome);
        assert_eq!(ctx.new_page().unwrap(), "FAKE-TARGET-1");
        assert_eq!(ctx.targets().unwrap().len(), 1);
    }

    #[test]
    fn missing_browser_without_auto_launch_is_reported() {
        let mut config = AppConfig::default();
        config.chrome.port = cdp_adapter::testing::closed_port();
        config.chrome.auto_launch = false;
        let ctx = AppContext::new(config);
        let err = ctx.call("Page.reload", None, 0).unwrap_err();
        assert!(err.hint.unwrap_or_default().contains("not running"));
    }

    #[test]
    fn scheduler_needs_running_instances() {
        let chrome = FakeChrome::start();
        let ctx = context_for(&chrome);
        assert!(matches!(
            ctx.start_scheduler(),
            Err(cdpctl_scheduler::SchedulerError::PoolEmpty)
        ));
        assert!(ctx.scheduler().is_none());
        ctx.shutdown();
    }

    #[cfg(unix)]
    fn sleeper_context(temp: &std::path::Path, base_port: u16) -> AppContext {
        use cdpctl_registry::CommandSpawner;

        let mut config = AppConfig::default();
        config.chrome.auto_launch = false;
        config.registry.base_port = base_port;
        config.registry.temp_root = Some(temp.join("cdp_chrome"));
        config.registry.startup_grace = Duration::from_millis(50);
        config.registry.kill_grace = Duration::from_secs(2);
        config.registry.auto_restart = true;
        config.scheduler.workers = 1;
        config.scheduler.max_retries = 0;
        AppContext::with_spawner(config, Arc::new(CommandSpawner::new("sleep", &["30"])))
    }

    #[cfg(unix)]
    #[test]
    fn restarted_instance_serves_tasks_again() {
        use cdpctl_scheduler::{Priority, TaskStatus};
        use std::process::Command;

        let temp = tempfile::tempdir().unwrap();
        let ctx = sleeper_context(temp.path(), 43_100);
        let instance = ctx.launch_instance(None).unwrap();
        let scheduler = ctx.start_scheduler().unwrap();

        let status = Command::new("kill")
            .args(["-9", &instance.pid.unwrap().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
        thread::sleep(Duration::from_millis(100));

        let report = ctx.registry().check_all();
        assert_eq!(report, vec![(instance.instance_id, false)]);
        let restarted = ctx.registry().get(instance.instance_id).unwrap();
        assert!(restarted.is_running());
        assert_eq!(restarted.restart_count, 1);
        assert_ne!(restarted.pid, instance.pid);

        let entry = scheduler.pool().entries().remove(0);
        assert!(entry.is_healthy);
        assert!(entry.is_available);

        let id = scheduler
            .submit_task("ping", json!({}), Priority::Normal)
            .unwrap();
        assert!(scheduler.wait_for_all_tasks(Duration::from_secs(5)));
        let task = scheduler.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.instance_id, Some(instance.instance_id));
        ctx.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn killing_a_busy_instance_retires_it_after_the_task() {
        use cdpctl_scheduler::{Lease, Priority, SchedulerError, Task, TaskStatus};
        use std::sync::mpsc;

        let temp = tempfile::tempdir().unwrap();
        let ctx = sleeper_context(temp.path(), 43_200);
        let instance = ctx.launch_instance(None).unwrap();
        let scheduler = ctx.start_scheduler().unwrap();

        let (started_tx, started_rx) = mpsc::channel::<u32>();
        let (finish_tx, finish_rx) = mpsc::channel::<()>();
        let finish_rx = Mutex::new(finish_rx);
        scheduler.register_handler(
            "hold",
            Arc::new(move |_task: &Task, lease: &Lease| -> Result<Value, SchedulerError> {
                let _ = started_tx.send(lease.instance_id);
                let _ = finish_rx.lock().recv_timeout(Duration::from_secs(5));
                Ok(json!({"held": lease.instance_id}))
            }),
        );

        let id = scheduler
            .submit_task("hold", json!({}), Priority::Normal)
            .unwrap();
        let leased = started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(leased, instance.instance_id);

        ctx.kill_instance(instance.instance_id, true).unwrap();
        let entry = scheduler.pool().entries().remove(0);
        assert!(entry.retiring);
        assert!(!entry.is_healthy);
        assert_eq!(scheduler.pool().available_count(), 0);

        finish_tx.send(()).unwrap();
        assert!(scheduler.wait_for_all_tasks(Duration::from_secs(5)));
        assert_eq!(scheduler.get_task(id).unwrap().status, TaskStatus::Completed);
        assert!(scheduler.pool().is_empty());
        assert!(ctx.registry().get(instance.instance_id).is_err());
        ctx.shutdown();
    }
}
