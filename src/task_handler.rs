//! The `cdp` task type: run one command against the leased instance.

use std::collections::HashMap;
use std::sync::Arc;

use cdp_adapter::config::{Endpoint, TransportConfig};
use cdp_adapter::{
    discover_browser_target, list_targets, AdapterResult, CommandIds, Dispatcher, ResponseBus,
};
use cdpctl_scheduler::{Lease, SchedulerError, Task, TaskHandler};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

pub const CDP_TASK_TYPE: &str = "cdp";

/// Task data is `{"method": "...", "params": {...}, "timeout_ms": 0, "target": "page/ID"}`;
/// only `method` is required.
///
/// A reply that carries a CDP `error` still completes the task: the browser
/// answered, so retrying would not change the outcome. Transport failures
/// fail the task and let the scheduler's retry budget decide.
pub struct CdpTaskHandler {
    host: String,
    transport: TransportConfig,
    connections: Mutex<HashMap<ConnectionKey, Arc<Dispatcher>>>,
}

/// Instance plus the explicit target, `None` for the instance's default page.
type ConnectionKey = (u32, Option<String>);

impl CdpTaskHandler {
    pub fn new(host: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            host: host.into(),
            transport,
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn dispatcher(&self, lease: &Lease, target: Option<&str>) -> AdapterResult<Arc<Dispatcher>> {
        let key = (lease.instance_id, target.map(str::to_string));
        if let Some(existing) = self.connections.lock().get(&key) {
            return Ok(Arc::clone(existing));
        }

        let endpoint = Endpoint::new(self.host.clone(), lease.debug_port);
        let target = match target {
            Some(target) => target.to_string(),
            None => default_target(&endpoint, &self.transport)?,
        };
        let dispatcher = Arc::new(Dispatcher::connect(
            endpoint,
            target.clone(),
            self.transport.clone(),
            Arc::new(CommandIds::new()),
            Arc::new(ResponseBus::new()),
        )?);
        debug!(instance = lease.instance_id, port = lease.debug_port, %target, "task connection opened");
        let mut connections = self.connections.lock();
        // a concurrent task on the same key may have connected first
        let cached = connections.entry(key).or_insert_with(|| Arc::clone(&dispatcher));
        if !Arc::ptr_eq(cached, &dispatcher) {
            let winner = Arc::clone(cached);
            drop(connections);
            dispatcher.close();
            return Ok(winner);
        }
        Ok(dispatcher)
    }

    fn forget(&self, key: &ConnectionKey) {
        if let Some(dispatcher) = self.connections.lock().remove(key) {
            dispatcher.close();
        }
    }

    /// Close every cached connection to `instance_id`; called when the
    /// instance is killed or its process is replaced.
    pub fn forget_instance(&self, instance_id: u32) -> usize {
        let closed: Vec<Arc<Dispatcher>> = {
            let mut connections = self.connections.lock();
            let keys: Vec<ConnectionKey> = connections
                .keys()
                .filter(|(id, _)| *id == instance_id)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| connections.remove(key))
                .collect()
        };
        for dispatcher in &closed {
            dispatcher.close();
        }
        closed.len()
    }

    pub fn forget_instances(&self) {
        let closed: Vec<Arc<Dispatcher>> =
            self.connections.lock().drain().map(|(_, dispatcher)| dispatcher).collect();
        for dispatcher in closed {
            dispatcher.close();
        }
    }

    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }
}

impl TaskHandler for CdpTaskHandler {
    fn execute(&self, task: &Task, lease: &Lease) -> Result<Value, SchedulerError> {
        let method = task
            .data
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| SchedulerError::Handler("task data has no \"method\"".into()))?;
        let params = task.data.get("params").cloned();
        let timeout_ms = task
            .data
            .get("timeout_ms")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let target = task.data.get("target").and_then(Value::as_str);

        let dispatcher = self
            .dispatcher(lease, target)
            .map_err(|err| SchedulerError::Handler(err.to_string()))?;
        match dispatcher.call_cmd(method, params, timeout_ms) {
            Ok(reply) => Ok(reply.into_value()),
            Err(err) => {
                if err.is_connection_dead() {
                    warn!(instance = lease.instance_id, %err, "dropping dead task connection");
                    self.forget(&(lease.instance_id, target.map(str::to_string)));
                }
                Err(SchedulerError::Handler(err.to_string()))
            }
        }
    }
}

/// First page target, else the browser target.
pub fn default_target(endpoint: &Endpoint, cfg: &TransportConfig) -> AdapterResult<String> {
    let targets = list_targets(endpoint, cfg)?;
    let page = targets.iter().find_map(|target| {
        let is_page = target.get("type").and_then(Value::as_str) == Some("page");
        let id = target.get("id").and_then(Value::as_str)?;
        is_page.then(|| format!("page/{id}"))
    });
    match page {
        Some(page) => Ok(page),
        None => discover_browser_target(endpoint, cfg),
    }
}
