use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{RegistryError, RegistryResult};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 CDP-Client/1.0";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Unknown => "unknown",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Crashed => "crashed",
            InstanceStatus::Failed => "failed",
        }
    }

    /// States in which the registry still owns a live child process.
    pub fn holds_process(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting | InstanceStatus::Running | InstanceStatus::Stopping
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instance launch configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// 0 lets the registry pick the next free port.
    pub debug_port: u16,
    pub window_width: u32,
    pub window_height: u32,
    pub headless: bool,
    pub incognito: bool,
    pub disable_gpu: bool,
    pub no_sandbox: bool,
    pub disable_dev_shm_usage: bool,
    pub user_data_dir: Option<PathBuf>,
    pub proxy_server: Option<String>,
    pub user_agent: Option<String>,
    pub extra_flags: Option<String>,
    pub memory_limit_mb: u64,
    pub timeout_sec: u64,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            debug_port: 0,
            window_width: 1280,
            window_height: 720,
            headless: true,
            incognito: false,
            disable_gpu: true,
            no_sandbox: true,
            disable_dev_shm_usage: true,
            user_data_dir: None,
            proxy_server: None,
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            extra_flags: None,
            memory_limit_mb: 512,
            timeout_sec: 30,
            auto_restart: true,
            max_restart_attempts: 3,
        }
    }
}

impl InstanceConfig {
    pub fn validate(&self) -> RegistryResult<()> {
        if self.debug_port != 0 && self.debug_port < 1024 {
            return Err(invalid(format!(
                "debug_port {} must be 0 or within 1024-65535",
                self.debug_port
            )));
        }
        for (name, value) in [
            ("window_width", self.window_width),
            ("window_height", self.window_height),
        ] {
            if !(100..=4096).contains(&value) {
                return Err(invalid(format!("{name} {value} must be within 100-4096")));
            }
        }
        if !(64..=8192).contains(&self.memory_limit_mb) {
            return Err(invalid(format!(
                "memory_limit_mb {} must be within 64-8192",
                self.memory_limit_mb
            )));
        }
        if !(5..=300).contains(&self.timeout_sec) {
            return Err(invalid(format!(
                "timeout_sec {} must be within 5-300",
                self.timeout_sec
            )));
        }
        if let Some(dir) = &self.user_data_dir {
            if dir.exists() && !dir.is_dir() {
                return Err(invalid(format!(
                    "user_data_dir {} is not a directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> RegistryError {
    RegistryError::InvalidConfig(message)
}

/// Point-in-time copy of one registry slot.
#[derive(Clone, Debug, Serialize)]
pub struct ChromeInstance {
    pub instance_id: u32,
    pub pid: Option<u32>,
    pub debug_port: u16,
    pub user_data_dir: PathBuf,
    pub status: InstanceStatus,
    pub config: InstanceConfig,
    pub started_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_check_failures: u32,
    pub restart_count: u32,
    pub memory_usage_mb: u64,
    pub last_error: Option<String>,
    pub error_count: u32,
}

impl ChromeInstance {
    pub(crate) fn new(
        instance_id: u32,
        debug_port: u16,
        user_data_dir: PathBuf,
        config: InstanceConfig,
    ) -> Self {
        Self {
            instance_id,
            pid: None,
            debug_port,
            user_data_dir,
            status: InstanceStatus::Unknown,
            config,
            started_at: Utc::now(),
            last_health_check: None,
            health_check_failures: 0,
            restart_count: 0,
            memory_usage_mb: 0,
            last_error: None,
            error_count: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub(crate) fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.error_count += 1;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub running: usize,
    pub failed: usize,
}

/// Why a health check flagged an instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HealthFailure {
    Exited,
    MemoryExceeded { rss_mb: u64, limit_mb: u64 },
}

impl fmt::Display for HealthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthFailure::Exited => f.write_str("process is no longer alive"),
            HealthFailure::MemoryExceeded { rss_mb, limit_mb } => {
                write!(f, "memory usage {rss_mb} MB exceeds limit {limit_mb} MB")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = InstanceConfig::default();
        assert_eq!(config.window_width, 1280);
        assert_eq!(config.memory_limit_mb, 512);
        assert_eq!(config.max_restart_attempts, 3);
        assert!(config.user_agent.as_deref().unwrap().ends_with("CDP-Client/1.0"));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cases: Vec<Box<dyn Fn(&mut InstanceConfig)>> = vec![
            Box::new(|c| c.debug_port = 80),
            Box::new(|c| c.window_width = 99),
            Box::new(|c| c.window_height = 5000),
            Box::new(|c| c.memory_limit_mb = 32),
            Box::new(|c| c.timeout_sec = 301),
        ];
        for mutate in cases {
            let mut config = InstanceConfig::default();
            mutate(&mut config);
            assert!(matches!(
                config.validate(),
                Err(RegistryError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn user_data_dir_must_be_a_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = InstanceConfig {
            user_data_dir: Some(file.path().to_path_buf()),
            ..InstanceConfig::default()
        };
        assert!(config.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let config = InstanceConfig {
            user_data_dir: Some(dir.path().join("not-yet-created")),
            ..InstanceConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn status_strings() {
        assert_eq!(InstanceStatus::Crashed.to_string(), "crashed");
        assert!(InstanceStatus::Stopping.holds_process());
        assert!(!InstanceStatus::Failed.holds_process());
    }
}
