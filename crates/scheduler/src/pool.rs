//! Pool of browser instances leased to tasks one at a time.

use std::time::Duration;

use cdpctl_registry::ChromeInstance;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{Strategy, TaskId};

#[derive(Clone, Debug, Serialize)]
pub struct PoolEntry {
    pub instance_id: u32,
    pub debug_port: u16,
    pub is_available: bool,
    pub is_healthy: bool,
    pub current_task: Option<TaskId>,
    /// Removed while leased; dropped from the pool when the lease comes back.
    pub retiring: bool,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_response_ms: f64,
}

impl PoolEntry {
    fn new(instance_id: u32, debug_port: u16) -> Self {
        Self {
            instance_id,
            debug_port,
            is_available: true,
            is_healthy: true,
            current_task: None,
            retiring: false,
            tasks_completed: 0,
            tasks_failed: 0,
            avg_response_ms: 0.0,
        }
    }

    fn eligible(&self) -> bool {
        self.is_available && self.is_healthy
    }

    fn load(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }
}

/// What a task holds while it runs on an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub instance_id: u32,
    pub debug_port: u16,
}

struct PoolState {
    entries: Vec<PoolEntry>,
    cursor: usize,
    closed: bool,
}

impl PoolState {
    fn select(&mut self, strategy: Strategy) -> Option<usize> {
        let eligible = self.entries.iter().filter(|e| e.eligible()).count();
        if eligible == 0 {
            return None;
        }
        match strategy {
            Strategy::RoundRobin => {
                let len = self.entries.len();
                let start = self.cursor % len;
                let idx = (0..len)
                    .map(|offset| (start + offset) % len)
                    .find(|&idx| self.entries[idx].eligible())?;
                self.cursor = (idx + 1) % len;
                Some(idx)
            }
            Strategy::LeastLoaded => self
                .eligible_indices()
                .min_by_key(|&idx| self.entries[idx].load()),
            Strategy::BestPerformance => self.eligible_indices().min_by(|&a, &b| {
                self.entries[a]
                    .avg_response_ms
                    .total_cmp(&self.entries[b].avg_response_ms)
            }),
            Strategy::Random => {
                let pick = rand::thread_rng().gen_range(0..eligible);
                self.eligible_indices().nth(pick)
            }
        }
    }

    fn eligible_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.eligible())
            .map(|(idx, _)| idx)
    }

    fn find(&mut self, instance_id: u32) -> Option<&mut PoolEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.instance_id == instance_id)
    }
}

/// Instances guarded by one mutex; callers with nothing eligible wait on a
/// condition variable until an instance is returned or marked healthy.
pub struct InstancePool {
    strategy: Strategy,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl InstancePool {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            state: Mutex::new(PoolState {
                entries: Vec::new(),
                cursor: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn from_instances<'a>(
        strategy: Strategy,
        instances: impl IntoIterator<Item = &'a ChromeInstance>,
    ) -> Self {
        let pool = Self::new(strategy);
        for instance in instances {
            pool.add_instance(instance.instance_id, instance.debug_port);
        }
        pool
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn add_instance(&self, instance_id: u32, debug_port: u16) {
        let mut state = self.state.lock();
        if let Some(entry) = state.find(instance_id) {
            entry.retiring = false;
            entry.debug_port = debug_port;
            return;
        }
        state.entries.push(PoolEntry::new(instance_id, debug_port));
        self.available.notify_one();
    }

    /// Removes an idle instance at once. A leased one leaves rotation now and
    /// is dropped when its lease is released.
    pub fn remove_instance(&self, instance_id: u32) -> bool {
        let mut state = self.state.lock();
        let Some(idx) = state
            .entries
            .iter()
            .position(|entry| entry.instance_id == instance_id)
        else {
            return false;
        };
        if state.entries[idx].is_available {
            state.entries.remove(idx);
        } else {
            let entry = &mut state.entries[idx];
            entry.retiring = true;
            entry.is_healthy = false;
            debug!(target: "cdp-pool", instance = instance_id, "leased instance retiring");
        }
        true
    }

    fn drop_if_retiring(state: &mut PoolState, instance_id: u32) -> bool {
        match state
            .entries
            .iter()
            .position(|entry| entry.instance_id == instance_id && entry.retiring)
        {
            Some(idx) => {
                state.entries.remove(idx);
                debug!(target: "cdp-pool", instance = instance_id, "retired instance dropped");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn available_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.eligible())
            .count()
    }

    pub fn entries(&self) -> Vec<PoolEntry> {
        self.state.lock().entries.clone()
    }

    /// Blocks until an instance is free. `None` once the pool is closed.
    pub fn acquire(&self, task: TaskId) -> Option<Lease> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(lease) = self.claim(&mut state, task) {
                return Some(lease);
            }
            self.available.wait(&mut state);
        }
    }

    pub fn acquire_timeout(&self, task: TaskId, timeout: Duration) -> Option<Lease> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(lease) = self.claim(&mut state, task) {
                return Some(lease);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return self.claim(&mut state, task);
            }
        }
    }

    pub fn try_acquire(&self, task: TaskId) -> Option<Lease> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        self.claim(&mut state, task)
    }

    fn claim(&self, state: &mut PoolState, task: TaskId) -> Option<Lease> {
        let idx = state.select(self.strategy)?;
        let entry = &mut state.entries[idx];
        entry.is_available = false;
        entry.current_task = Some(task);
        debug!(target: "cdp-pool", instance = entry.instance_id, task, "instance leased");
        Some(Lease {
            instance_id: entry.instance_id,
            debug_port: entry.debug_port,
        })
    }

    /// Return an instance after a task ran on it, folding the outcome into its stats.
    pub fn release(&self, lease: Lease, success: bool, elapsed: Duration) {
        let mut state = self.state.lock();
        let Some(entry) = state.find(lease.instance_id) else {
            warn!(target: "cdp-pool", instance = lease.instance_id, "released unknown instance");
            return;
        };
        let previous = entry.load() as f64;
        let sample = elapsed.as_secs_f64() * 1000.0;
        entry.avg_response_ms = (entry.avg_response_ms * previous + sample) / (previous + 1.0);
        if success {
            entry.tasks_completed += 1;
        } else {
            entry.tasks_failed += 1;
        }
        entry.is_available = true;
        entry.current_task = None;
        if !Self::drop_if_retiring(&mut state, lease.instance_id) {
            self.available.notify_one();
        }
    }

    /// Return an instance without recording an outcome.
    pub fn give_back(&self, lease: Lease) {
        let mut state = self.state.lock();
        if Self::drop_if_retiring(&mut state, lease.instance_id) {
            return;
        }
        if let Some(entry) = state.find(lease.instance_id) {
            entry.is_available = true;
            entry.current_task = None;
            self.available.notify_one();
        }
    }

    pub fn mark_unhealthy(&self, instance_id: u32) -> bool {
        let mut state = self.state.lock();
        match state.find(instance_id) {
            Some(entry) => {
                entry.is_healthy = false;
                warn!(target: "cdp-pool", instance = instance_id, "instance marked unhealthy");
                true
            }
            None => false,
        }
    }

    pub fn mark_healthy(&self, instance_id: u32) -> bool {
        let mut state = self.state.lock();
        match state.find(instance_id) {
            Some(entry) if !entry.retiring => {
                entry.is_healthy = true;
                self.available.notify_all();
                true
            }
            _ => false,
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }
}
