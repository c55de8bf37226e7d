//! Periodic liveness sweep over a [`ChromeRegistry`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::errors::{RegistryError, RegistryResult};
use crate::state::ChromeRegistry;

struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread calling [`ChromeRegistry::check_all`] every interval.
/// Stops on [`HealthMonitor::stop`] or drop.
pub struct HealthMonitor {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn start(registry: Arc<ChromeRegistry>, interval: Duration) -> RegistryResult<Self> {
        let signal = Arc::new(Signal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("cdp-health".into())
            .spawn(move || run(registry, interval, thread_signal))
            .map_err(|err| RegistryError::Internal(format!("spawn health monitor: {err}")))?;
        info!(target: "cdp-health", interval = ?interval, "health monitor started");
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            info!(target: "cdp-health", "health monitor stopped");
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(registry: Arc<ChromeRegistry>, interval: Duration, signal: Arc<Signal>) {
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                return;
            }
        }
        let results = registry.check_all();
        let unhealthy = results.iter().filter(|(_, healthy)| !healthy).count();
        debug!(
            target: "cdp-health",
            checked = results.len(),
            unhealthy,
            "health sweep finished"
        );
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::model::{InstanceConfig, InstanceStatus};
    use crate::spawn::CommandSpawner;
    use std::time::Instant;

    use nix::sys::signal::{self, Signal as NixSignal};
    use nix::unistd::Pid;

    #[test]
    fn monitor_detects_crash_between_sweeps() {
        let temp = tempfile::tempdir().unwrap();
        let registry = Arc::new(ChromeRegistry::new(
            RegistryConfig {
                base_port: 41_600,
                temp_root: Some(temp.path().join("cdp_chrome")),
                startup_grace: Duration::from_millis(50),
                kill_grace: Duration::from_secs(2),
                ..RegistryConfig::default()
            },
            Arc::new(CommandSpawner::new("sleep", &["30"])),
        ));
        let instance = registry
            .launch(InstanceConfig {
                auto_restart: false,
                ..InstanceConfig::default()
            })
            .unwrap();

        let monitor = HealthMonitor::start(Arc::clone(&registry), Duration::from_millis(50)).unwrap();
        signal::kill(
            Pid::from_raw(instance.pid.unwrap() as i32),
            NixSignal::SIGKILL,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut status = InstanceStatus::Running;
        while Instant::now() < deadline {
            status = registry.get(instance.instance_id).unwrap().status;
            if status == InstanceStatus::Crashed {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        monitor.stop();
        assert_eq!(status, InstanceStatus::Crashed);
        registry.emergency_cleanup();
    }

    #[test]
    fn stop_returns_promptly() {
        let registry = Arc::new(ChromeRegistry::new(
            RegistryConfig::default(),
            Arc::new(CommandSpawner::new("sleep", &["30"])),
        ));
        let monitor = HealthMonitor::start(registry, Duration::from_secs(3600)).unwrap();
        let started = Instant::now();
        monitor.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
