use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cdp_adapter::supervisor::is_port_open;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::config::RegistryConfig;
use crate::errors::{RegistryError, RegistryResult};
use crate::metrics;
use crate::model::{ChromeInstance, HealthFailure, InstanceConfig, InstanceStatus, RegistryStats};
use crate::process::{child_alive, resident_memory_mb, terminate};
use crate::spawn::{instance_launch_args, ProcessSpawner};

/// Invoked with the instance lock held and the registry lock released.
/// Must not call back into the registry for the same instance.
pub type HealthCallback = Arc<dyn Fn(&ChromeInstance, &HealthFailure) + Send + Sync>;

/// Invoked with no registry locks held once a restarted instance is running again.
pub type RecoveryCallback = Arc<dyn Fn(&ChromeInstance) + Send + Sync>;

const TRANSITION_POLL: Duration = Duration::from_millis(50);

struct Entry {
    instance: ChromeInstance,
    child: Option<Child>,
    owns_dir: bool,
}

#[derive(Clone)]
struct SlotRecord {
    id: u32,
    port: u16,
    entry: Arc<Mutex<Entry>>,
}

struct Slots {
    slots: Vec<Option<SlotRecord>>,
    next_instance_id: u32,
    next_port: u16,
}

impl Slots {
    fn live(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn port_taken(&self, port: u16) -> Option<u32> {
        self.slots
            .iter()
            .flatten()
            .find(|record| record.port == port)
            .map(|record| record.id)
    }

    fn records(&self) -> Vec<SlotRecord> {
        self.slots.iter().flatten().cloned().collect()
    }
}

/// Fixed-capacity table of Chrome processes owned by this process.
///
/// The slot table sits behind one mutex; each instance carries its own lock.
/// The slot lock is never held while an instance lock is taken.
pub struct ChromeRegistry {
    config: RegistryConfig,
    temp_root: PathBuf,
    spawner: Arc<dyn ProcessSpawner>,
    slots: Mutex<Slots>,
    health_callback: RwLock<Option<HealthCallback>>,
    recovery_callback: RwLock<Option<RecoveryCallback>>,
}

impl ChromeRegistry {
    pub fn new(config: RegistryConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let temp_root = config.resolved_temp_root();
        let slots = Slots {
            slots: vec![None; config.max_instances],
            next_instance_id: 1,
            next_port: config.base_port,
        };
        info!(
            target: "cdp-registry",
            max = config.max_instances,
            temp_root = %temp_root.display(),
            "chrome registry initialized"
        );
        Self {
            config,
            temp_root,
            spawner,
            slots: Mutex::new(slots),
            health_callback: RwLock::new(None),
            recovery_callback: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn set_health_callback(&self, callback: HealthCallback) {
        *self.health_callback.write() = Some(callback);
    }

    pub fn clear_health_callback(&self) {
        *self.health_callback.write() = None;
    }

    pub fn set_recovery_callback(&self, callback: RecoveryCallback) {
        *self.recovery_callback.write() = Some(callback);
    }

    pub fn clear_recovery_callback(&self) {
        *self.recovery_callback.write() = None;
    }

    /// Reserve a slot, spawn the process and wait out the startup grace period.
    ///
    /// A process that exits during the grace period leaves a `Failed` entry
    /// behind and the call returns `LaunchFailed`.
    pub fn launch(&self, config: InstanceConfig) -> RegistryResult<ChromeInstance> {
        config.validate()?;
        let record = self.reserve(config)?;
        let result = self.start_process(&record);
        metrics::record_launch(result.is_ok());
        match &result {
            Ok(instance) => info!(
                target: "cdp-registry",
                id = instance.instance_id,
                pid = instance.pid,
                port = instance.debug_port,
                "chrome instance running"
            ),
            Err(err) => error!(target: "cdp-registry", id = record.id, %err, "chrome instance failed to start"),
        }
        result
    }

    fn reserve(&self, config: InstanceConfig) -> RegistryResult<SlotRecord> {
        let mut slots = self.slots.lock();
        let index = slots
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::LimitReached(self.config.max_instances))?;

        let port = if config.debug_port != 0 {
            if let Some(owner) = slots.port_taken(config.debug_port) {
                return Err(RegistryError::InvalidConfig(format!(
                    "debug_port {} already used by instance {owner}",
                    config.debug_port
                )));
            }
            config.debug_port
        } else {
            self.allocate_port(&mut slots)?
        };

        let id = slots.next_instance_id;
        slots.next_instance_id += 1;

        let (user_data_dir, owns_dir) = match &config.user_data_dir {
            Some(dir) => (dir.clone(), false),
            None => (self.temp_root.join(format!("chrome_instance_{id}")), true),
        };
        let record = SlotRecord {
            id,
            port,
            entry: Arc::new(Mutex::new(Entry {
                instance: ChromeInstance::new(id, port, user_data_dir, config),
                child: None,
                owns_dir,
            })),
        };
        slots.slots[index] = Some(record.clone());
        metrics::set_live_instances(slots.live());
        Ok(record)
    }

    fn allocate_port(&self, slots: &mut Slots) -> RegistryResult<u16> {
        for _ in 0..=u16::MAX as u32 {
            let candidate = slots.next_port;
            slots.next_port = candidate
                .checked_add(1)
                .unwrap_or(self.config.base_port);
            if candidate < 1024 || slots.port_taken(candidate).is_some() {
                continue;
            }
            if is_port_open("127.0.0.1", candidate) {
                warn!(target: "cdp-registry", port = candidate, "port busy, skipping");
                continue;
            }
            return Ok(candidate);
        }
        Err(RegistryError::Internal("no free debug port".into()))
    }

    fn start_process(&self, record: &SlotRecord) -> RegistryResult<ChromeInstance> {
        let (args, dir) = {
            let mut entry = record.entry.lock();
            entry.instance.status = InstanceStatus::Starting;
            let dir = entry.instance.user_data_dir.clone();
            (
                instance_launch_args(&entry.instance.config, record.port, &dir),
                dir,
            )
        };

        let spawned = fs::create_dir_all(&dir)
            .map_err(|err| {
                RegistryError::LaunchFailed(format!(
                    "failed to create user data directory {}: {err}",
                    dir.display()
                ))
            })
            .and_then(|_| self.spawner.spawn(&args));

        {
            let mut entry = record.entry.lock();
            match spawned {
                Ok(mut child) => {
                    if entry.instance.status != InstanceStatus::Starting {
                        // killed while the process was being spawned
                        drop(entry);
                        let _ = terminate(&mut child, self.config.kill_grace, true);
                        return Err(stopped_while_launching(record.id));
                    }
                    entry.instance.pid = Some(child.id());
                    entry.instance.started_at = Utc::now();
                    entry.child = Some(child);
                }
                Err(err) => {
                    entry.instance.status = InstanceStatus::Failed;
                    entry.instance.record_error(err.to_string());
                    return Err(err);
                }
            }
        }

        thread::sleep(self.config.startup_grace);

        let mut entry = record.entry.lock();
        if entry.instance.status != InstanceStatus::Starting {
            return Err(stopped_while_launching(record.id));
        }
        let alive = entry.child.as_mut().map(child_alive).unwrap_or(false);
        if !alive {
            entry.instance.status = InstanceStatus::Failed;
            entry.instance.pid = None;
            entry.child = None;
            entry.instance.record_error("process exited immediately after launch");
            return Err(RegistryError::LaunchFailed(format!(
                "instance {} exited immediately after launch",
                record.id
            )));
        }
        entry.instance.status = InstanceStatus::Running;
        Ok(entry.instance.clone())
    }

    fn record(&self, id: u32) -> RegistryResult<SlotRecord> {
        self.slots
            .lock()
            .slots
            .iter()
            .flatten()
            .find(|record| record.id == id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    /// Stop the process, remove registry-owned temp files and free the slot.
    ///
    /// While a restart or another kill holds the process, this waits for it to
    /// settle; a concurrent kill that completes first makes this a no-op.
    pub fn kill(&self, id: u32, force: bool) -> RegistryResult<()> {
        let record = self.record(id)?;
        let deadline =
            Instant::now() + self.config.kill_grace + self.config.startup_grace + Duration::from_secs(2);
        let (child, dir, owns_dir) = loop {
            let mut entry = record.entry.lock();
            let status = entry.instance.status;
            match status {
                InstanceStatus::Stopped => return Ok(()),
                InstanceStatus::Stopping if entry.child.is_none() => {
                    drop(entry);
                    if Instant::now() >= deadline {
                        return Err(RegistryError::Busy(id));
                    }
                    thread::sleep(TRANSITION_POLL);
                }
                _ => {
                    entry.instance.status = InstanceStatus::Stopping;
                    break (
                        entry.child.take(),
                        entry.instance.user_data_dir.clone(),
                        entry.owns_dir,
                    );
                }
            }
        };

        if let Some(mut child) = child {
            if let Err(err) = terminate(&mut child, self.config.kill_grace, force) {
                let mut entry = record.entry.lock();
                entry.instance.record_error(err.to_string());
                entry.child = Some(child);
                return Err(err);
            }
        }
        if owns_dir {
            self.remove_scoped_dir(&dir);
        }
        {
            let mut entry = record.entry.lock();
            entry.instance.status = InstanceStatus::Stopped;
            entry.instance.pid = None;
        }

        let mut slots = self.slots.lock();
        if let Some(slot) = slots
            .slots
            .iter_mut()
            .find(|slot| slot.as_ref().map(|record| record.id) == Some(id))
        {
            *slot = None;
        }
        metrics::set_live_instances(slots.live());
        metrics::record_kill();
        info!(target: "cdp-registry", id, force, "chrome instance stopped");
        Ok(())
    }

    /// Delete `dir` only when it lives strictly under the registry temp root.
    fn remove_scoped_dir(&self, dir: &Path) {
        if dir == self.temp_root || !dir.starts_with(&self.temp_root) {
            warn!(
                target: "cdp-registry",
                dir = %dir.display(),
                "refusing to remove directory outside the registry temp root"
            );
            return;
        }
        match fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(target: "cdp-registry", dir = %dir.display(), %err, "temp cleanup failed"),
        }
    }

    pub fn get(&self, id: u32) -> RegistryResult<ChromeInstance> {
        let record = self.record(id)?;
        let instance = record.entry.lock().instance.clone();
        Ok(instance)
    }

    /// Snapshots of every slot, ordered by instance id.
    pub fn list(&self) -> Vec<ChromeInstance> {
        let records = self.slots.lock().records();
        let mut instances: Vec<_> = records
            .iter()
            .map(|record| record.entry.lock().instance.clone())
            .collect();
        instances.sort_by_key(|instance| instance.instance_id);
        instances
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<ChromeInstance> {
        self.list()
            .into_iter()
            .find(|instance| instance.pid == Some(pid))
    }

    pub fn find_by_port(&self, port: u16) -> Option<ChromeInstance> {
        self.list()
            .into_iter()
            .find(|instance| instance.debug_port == port)
    }

    pub fn stats(&self) -> RegistryStats {
        let instances = self.list();
        RegistryStats {
            total: instances.len(),
            running: instances.iter().filter(|i| i.is_running()).count(),
            failed: instances
                .iter()
                .filter(|i| matches!(i.status, InstanceStatus::Failed | InstanceStatus::Crashed))
                .count(),
        }
    }

    /// Health-check one instance. Returns whether it is healthy.
    ///
    /// A dead process flips to `Crashed`; a live one over its memory limit is
    /// flagged but keeps running. Either way the failure counter grows, the
    /// health callback fires, and the instance is restarted when its restart
    /// budget allows.
    pub fn check_health(&self, id: u32) -> RegistryResult<bool> {
        let record = self.record(id)?;
        let callback = self.health_callback.read().clone();

        let mut entry = record.entry.lock();
        entry.instance.last_health_check = Some(Utc::now());
        if !matches!(
            entry.instance.status,
            InstanceStatus::Starting | InstanceStatus::Running
        ) {
            return Ok(false);
        }

        let outcome = entry
            .child
            .as_mut()
            .map(|child| (child_alive(child), child.id()));
        let failure = match outcome {
            Some((true, pid)) => {
                match resident_memory_mb(pid) {
                    Some(rss) => {
                        entry.instance.memory_usage_mb = rss;
                        let limit = entry.instance.config.memory_limit_mb;
                        (rss > limit).then_some(HealthFailure::MemoryExceeded {
                            rss_mb: rss,
                            limit_mb: limit,
                        })
                    }
                    None => None,
                }
            }
            _ => Some(HealthFailure::Exited),
        };

        let Some(failure) = failure else {
            return Ok(true);
        };

        entry.instance.health_check_failures += 1;
        entry.instance.record_error(failure.to_string());
        let reason = match failure {
            HealthFailure::Exited => {
                entry.instance.status = InstanceStatus::Crashed;
                entry.instance.pid = None;
                if let Some(mut child) = entry.child.take() {
                    let _ = child.wait();
                }
                "exited"
            }
            HealthFailure::MemoryExceeded { .. } => "memory",
        };
        metrics::record_health_failure(reason);
        warn!(
            target: "cdp-health",
            id,
            failures = entry.instance.health_check_failures,
            %failure,
            "instance failed health check"
        );

        if let Some(callback) = callback.as_ref() {
            callback(&entry.instance, &failure);
        }

        let config = &entry.instance.config;
        let restart = config.auto_restart && entry.instance.restart_count < config.max_restart_attempts;
        if config.auto_restart && !restart {
            error!(
                target: "cdp-health",
                id,
                restarts = entry.instance.restart_count,
                "restart budget exhausted"
            );
        }
        drop(entry);

        if restart {
            if let Err(err) = self.restart_instance(id) {
                error!(target: "cdp-health", id, %err, "automatic restart failed");
            }
        }
        Ok(false)
    }

    /// Health-check every instance; ids that vanished mid-sweep are skipped.
    pub fn check_all(&self) -> Vec<(u32, bool)> {
        let ids: Vec<u32> = self.slots.lock().records().iter().map(|r| r.id).collect();
        ids.into_iter()
            .filter_map(|id| self.check_health(id).ok().map(|healthy| (id, healthy)))
            .collect()
    }

    /// Replace the process behind `id`, keeping its id, port and data directory.
    pub fn restart_instance(&self, id: u32) -> RegistryResult<ChromeInstance> {
        let record = self.record(id)?;
        let child = {
            let mut entry = record.entry.lock();
            if matches!(
                entry.instance.status,
                InstanceStatus::Stopping | InstanceStatus::Stopped
            ) {
                return Err(RegistryError::Busy(id));
            }
            entry.instance.status = InstanceStatus::Stopping;
            entry.child.take()
        };
        if let Some(mut child) = child {
            if let Err(err) = terminate(&mut child, self.config.kill_grace, true) {
                let mut entry = record.entry.lock();
                entry.instance.record_error(err.to_string());
                entry.child = Some(child);
                return Err(err);
            }
        }
        {
            let mut entry = record.entry.lock();
            entry.instance.pid = None;
            entry.instance.restart_count += 1;
        }
        metrics::record_restart();
        info!(target: "cdp-registry", id, "restarting chrome instance");
        let instance = self.start_process(&record)?;
        let callback = self.recovery_callback.read().clone();
        if let Some(callback) = callback {
            callback(&instance);
        }
        Ok(instance)
    }

    /// Force-kill and reap everything, clear the table. Returns how many
    /// processes were still alive.
    pub fn emergency_cleanup(&self) -> usize {
        let records: Vec<SlotRecord> = {
            let mut slots = self.slots.lock();
            let taken = slots.records();
            slots.slots.iter_mut().for_each(|slot| *slot = None);
            taken
        };

        let mut killed = 0;
        for record in records {
            let mut entry = record.entry.lock();
            if let Some(mut child) = entry.child.take() {
                if entry.instance.status != InstanceStatus::Stopped {
                    killed += 1;
                }
                if let Err(err) = terminate(&mut child, self.config.kill_grace, true) {
                    error!(target: "cdp-registry", id = record.id, %err, "emergency kill failed");
                }
            }
            entry.instance.status = InstanceStatus::Stopped;
            entry.instance.pid = None;
            if entry.owns_dir {
                let dir = entry.instance.user_data_dir.clone();
                drop(entry);
                self.remove_scoped_dir(&dir);
            }
        }
        metrics::set_live_instances(0);
        warn!(target: "cdp-registry", killed, "emergency cleanup finished");
        killed
    }
}

fn stopped_while_launching(id: u32) -> RegistryError {
    RegistryError::LaunchFailed(format!("instance {id} was stopped while launching"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::spawn::CommandSpawner;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    fn registry(temp: &Path, base_port: u16, spawner: CommandSpawner) -> ChromeRegistry {
        let config = RegistryConfig {
            base_port,
            temp_root: Some(temp.join("cdp_chrome")),
            startup_grace: Duration::from_millis(50),
            kill_grace: Duration::from_secs(2),
            ..RegistryConfig::default()
        };
        ChromeRegistry::new(config, Arc::new(spawner))
    }

    fn sleeper() -> CommandSpawner {
        CommandSpawner::new("sleep", &["30"])
    }

    #[test]
    fn ids_and_ports_are_monotonic() {
        let temp = tempfile::tempdir().unwrap();
        let registry = registry(temp.path(), 41_000, sleeper());

        let launched: Vec<_> = (0..5)
            .map(|_| registry.launch(InstanceConfig::default()).unwrap())
            .collect();
        let ports: Vec<u16> = launched.iter().map(|i| i.debug_port).collect();
        assert!(ports.windows(2).all(|pair| pair[0] < pair[1]), "{ports:?}");
        assert_eq!(
            launched.iter().map(|i| i.instance_id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert!(launched.iter().all(|i| i.status == InstanceStatus::Running));

        registry.kill(3, false).unwrap();
        assert!(matches!(registry.get(3), Err(RegistryError::NotFound(3))));
        let next = registry.launch(InstanceConfig::default()).unwrap();
        assert_eq!(next.instance_id, 6);
        assert_eq!(registry.stats().running, 5);

        assert_eq!(registry.emergency_cleanup(), 5);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn kill_removes_only_registry_owned_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let registry = registry(temp.path(), 41_100, sleeper());

        let owned = registry.launch(InstanceConfig::default()).unwrap();
        assert!(owned.user_data_dir.starts_with(registry.temp_root()));
        assert!(owned.user_data_dir.is_dir());

        let external_dir = temp.path().join("my-profile");
        let external = registry
            .launch(InstanceConfig {
                user_data_dir: Some(external_dir.clone()),
                ..InstanceConfig::default()
            })
            .unwrap();

        let pid = owned.pid.unwrap();
        assert_eq!(registry.find_by_pid(pid).unwrap().instance_id, owned.instance_id);
        assert_eq!(
            registry.find_by_port(external.debug_port).unwrap().instance_id,
            external.instance_id
        );

        registry.kill(owned.instance_id, false).unwrap();
        registry.kill(external.instance_id, true).unwrap();
        assert!(!owned.user_data_dir.exists());
        assert!(external_dir.is_dir());
        assert!(registry.find_by_pid(pid).is_none());
    }

    #[test]
    fn limit_and_duplicate_port() {
        let temp = tempfile::tempdir().unwrap();
        let config = RegistryConfig {
            max_instances: 2,
            base_port: 41_200,
            temp_root: Some(temp.path().join("cdp_chrome")),
            startup_grace: Duration::from_millis(50),
            kill_grace: Duration::from_secs(2),
            ..RegistryConfig::default()
        };
        let registry = ChromeRegistry::new(config, Arc::new(sleeper()));

        let first = registry
            .launch(InstanceConfig {
                debug_port: 41_250,
                ..InstanceConfig::default()
            })
            .unwrap();
        assert_eq!(first.debug_port, 41_250);
        assert!(matches!(
            registry.launch(InstanceConfig {
                debug_port: 41_250,
                ..InstanceConfig::default()
            }),
            Err(RegistryError::InvalidConfig(_))
        ));
        registry.launch(InstanceConfig::default()).unwrap();
        assert!(matches!(
            registry.launch(InstanceConfig::default()),
            Err(RegistryError::LimitReached(2))
        ));
        registry.emergency_cleanup();
    }

    #[test]
    fn immediate_exit_marks_failed() {
        let temp = tempfile::tempdir().unwrap();
        let registry = registry(temp.path(), 41_300, CommandSpawner::new("true", &[]));
        let err = registry
            .launch(registry.config().instance_defaults())
            .unwrap_err();
        assert!(matches!(err, RegistryError::LaunchFailed(_)));

        let stats = registry.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.failed, 1);
        let failed = &registry.list()[0];
        assert_eq!(failed.status, InstanceStatus::Failed);
        assert!(failed.pid.is_none());
        assert_eq!(failed.error_count, 1);

        registry.kill(failed.instance_id, true).unwrap();
        assert_eq!(registry.stats().total, 0);
    }

    #[test]
    fn external_sigkill_triggers_single_callback_and_restart() {
        let temp = tempfile::tempdir().unwrap();
        let registry = registry(temp.path(), 41_400, sleeper());
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        registry.set_health_callback(Arc::new(move |instance: &ChromeInstance, failure: &HealthFailure| {
            assert_eq!(instance.status, InstanceStatus::Crashed);
            assert_eq!(*failure, HealthFailure::Exited);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let instance = registry.launch(InstanceConfig::default()).unwrap();
        let pid = instance.pid.unwrap();
        assert!(registry.check_health(instance.instance_id).unwrap());

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
        thread::sleep(Duration::from_millis(100));

        assert!(!registry.check_health(instance.instance_id).unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let restarted = registry.get(instance.instance_id).unwrap();
        assert_eq!(restarted.status, InstanceStatus::Running);
        assert_eq!(restarted.restart_count, 1);
        assert_eq!(restarted.health_check_failures, 1);
        assert_eq!(restarted.debug_port, instance.debug_port);
        assert_ne!(restarted.pid, Some(pid));

        assert!(registry.check_health(instance.instance_id).unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        registry.emergency_cleanup();
    }

    #[test]
    fn crash_without_auto_restart_stays_crashed() {
        let temp = tempfile::tempdir().unwrap();
        let registry = registry(temp.path(), 41_500, sleeper());
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        registry.set_health_callback(Arc::new(move |_: &ChromeInstance, _: &HealthFailure| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let instance = registry
            .launch(InstanceConfig {
                auto_restart: false,
                ..InstanceConfig::default()
            })
            .unwrap();
        signal::kill(
            Pid::from_raw(instance.pid.unwrap() as i32),
            Signal::SIGKILL,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(100));

        assert!(!registry.check_health(instance.instance_id).unwrap());
        assert!(!registry.check_health(instance.instance_id).unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let crashed = registry.get(instance.instance_id).unwrap();
        assert_eq!(crashed.status, InstanceStatus::Crashed);
        assert_eq!(registry.stats().failed, 1);
        registry.emergency_cleanup();
    }

    /// Spawns instantly the first time, then waits `delay` before each spawn.
    struct SlowRespawner {
        inner: CommandSpawner,
        delay: Duration,
        spawned: parking_lot::Mutex<Vec<u32>>,
    }

    impl ProcessSpawner for SlowRespawner {
        fn spawn(&self, args: &[String]) -> RegistryResult<Child> {
            if !self.spawned.lock().is_empty() {
                thread::sleep(self.delay);
            }
            let child = self.inner.spawn(args)?;
            self.spawned.lock().push(child.id());
            Ok(child)
        }
    }

    #[test]
    fn recovery_callback_fires_once_restarted() {
        let temp = tempfile::tempdir().unwrap();
        let registry = registry(temp.path(), 41_600, sleeper());
        let recovered = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&recovered);
        registry.set_recovery_callback(Arc::new(move |instance: &ChromeInstance| {
            seen.lock().push((instance.instance_id, instance.status, instance.restart_count));
        }));

        let instance = registry.launch(InstanceConfig::default()).unwrap();
        assert!(recovered.lock().is_empty());
        signal::kill(Pid::from_raw(instance.pid.unwrap() as i32), Signal::SIGKILL).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(!registry.check_health(instance.instance_id).unwrap());
        assert_eq!(
            *recovered.lock(),
            vec![(instance.instance_id, InstanceStatus::Running, 1)]
        );

        registry.restart_instance(instance.instance_id).unwrap();
        assert_eq!(recovered.lock().len(), 2);

        registry.clear_recovery_callback();
        registry.restart_instance(instance.instance_id).unwrap();
        assert_eq!(recovered.lock().len(), 2);
        registry.emergency_cleanup();
    }

    #[test]
    fn kill_waits_for_a_kill_already_in_progress() {
        let temp = tempfile::tempdir().unwrap();
        let config = RegistryConfig {
            base_port: 41_700,
            temp_root: Some(temp.path().join("cdp_chrome")),
            startup_grace: Duration::from_millis(50),
            kill_grace: Duration::from_secs(1),
            ..RegistryConfig::default()
        };
        // ignores SIGTERM, so a graceful kill sits out the whole grace period
        let stubborn = CommandSpawner::new("sh", &["-c", "trap '' TERM; exec sleep 30"]);
        let registry = Arc::new(ChromeRegistry::new(config, Arc::new(stubborn)));
        let id = registry.launch(InstanceConfig::default()).unwrap().instance_id;

        let first = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.kill(id, false))
        };
        thread::sleep(Duration::from_millis(200));
        assert_eq!(registry.get(id).unwrap().status, InstanceStatus::Stopping);

        let started = Instant::now();
        registry.kill(id, false).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        first.join().unwrap().unwrap();
        assert!(matches!(registry.get(id), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn kill_during_restart_leaves_no_process_behind() {
        let temp = tempfile::tempdir().unwrap();
        let config = RegistryConfig {
            base_port: 41_800,
            temp_root: Some(temp.path().join("cdp_chrome")),
            startup_grace: Duration::from_millis(50),
            kill_grace: Duration::from_secs(2),
            ..RegistryConfig::default()
        };
        let spawner = Arc::new(SlowRespawner {
            inner: sleeper(),
            delay: Duration::from_millis(500),
            spawned: parking_lot::Mutex::new(Vec::new()),
        });
        let registry = Arc::new(ChromeRegistry::new(config, spawner.clone()));
        let recovered = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&recovered);
        registry.set_recovery_callback(Arc::new(move |_: &ChromeInstance| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        let id = registry.launch(InstanceConfig::default()).unwrap().instance_id;

        let restart = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.restart_instance(id))
        };
        thread::sleep(Duration::from_millis(150));
        registry.kill(id, true).unwrap();
        assert!(matches!(registry.get(id), Err(RegistryError::NotFound(_))));

        let err = restart.join().unwrap().unwrap_err();
        assert!(matches!(err, RegistryError::LaunchFailed(_)));
        assert_eq!(recovered.load(Ordering::SeqCst), 0);
        let spawned = spawner.spawned.lock().clone();
        assert_eq!(spawned.len(), 2);
        assert!(spawned.iter().all(|pid| !crate::process::pid_alive(*pid)));
    }
}
