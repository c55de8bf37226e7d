//! Signal delivery, liveness checks and resource sampling for child processes.

use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::{RegistryError, RegistryResult};

pub const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `kill(pid, 0)`: the process exists and we may signal it.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Liveness of a child we own. Reaps it without blocking first so a zombie
/// does not pass the `kill(pid, 0)` check.
pub fn child_alive(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(Some(_)) => false,
        Ok(None) => pid_alive(child.id()),
        Err(err) => {
            warn!(target: "cdp-registry", pid = child.id(), ?err, "try_wait failed");
            pid_alive(child.id())
        }
    }
}

/// Stop a child: `SIGTERM` and poll for up to `grace`, then `SIGKILL`, then reap.
/// `force` skips straight to `SIGKILL`.
pub fn terminate(child: &mut Child, grace: Duration, force: bool) -> RegistryResult<()> {
    let pid = child.id();
    if let Ok(Some(status)) = child.try_wait() {
        debug!(target: "cdp-registry", pid, ?status, "process already exited");
        return Ok(());
    }

    if !force {
        send_sigterm(pid);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(target: "cdp-registry", pid, ?status, "process exited after SIGTERM");
                    return Ok(());
                }
                Ok(None) => thread::sleep(TERMINATE_POLL_INTERVAL),
                Err(err) => {
                    return Err(RegistryError::KillFailed(format!("wait for {pid}: {err}")));
                }
            }
        }
        warn!(target: "cdp-registry", pid, "process ignored SIGTERM, escalating to SIGKILL");
    }

    if let Err(err) = child.kill() {
        if child.try_wait().ok().flatten().is_none() {
            return Err(RegistryError::KillFailed(format!("SIGKILL {pid}: {err}")));
        }
    }
    child
        .wait()
        .map(|_| ())
        .map_err(|err| RegistryError::KillFailed(format!("reap {pid}: {err}")))
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => debug!(target: "cdp-registry", pid, "sent SIGTERM"),
        Err(Errno::ESRCH) => debug!(target: "cdp-registry", pid, "process already gone"),
        Err(err) => warn!(target: "cdp-registry", pid, %err, "SIGTERM failed"),
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

/// Resident set size in MB, if the platform exposes it.
#[cfg(target_os = "linux")]
pub fn resident_memory_mb(pid: u32) -> Option<u64> {
    use nix::unistd::{sysconf, SysconfVar};

    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|size| u64::try_from(size).ok())
        .unwrap_or(4096);
    Some(resident_pages * page_size / (1024 * 1024))
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_mb(_pid: u32) -> Option<u64> {
    None
}
