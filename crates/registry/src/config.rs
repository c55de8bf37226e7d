use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::InstanceConfig;

pub const MAX_INSTANCES: usize = 32;
pub const BASE_DEBUG_PORT: u16 = 9222;
pub const TEMP_DIR_NAME: &str = "cdp_chrome";

/// Registry-wide settings. Per-instance knobs live in [`InstanceConfig`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_instances: usize,
    pub base_port: u16,
    #[serde(with = "humantime_duration")]
    pub health_check_interval: Duration,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    pub temp_root: Option<PathBuf>,
    /// How long a freshly spawned process must survive before it counts as running.
    #[serde(skip)]
    pub startup_grace: Duration,
    /// How long `SIGTERM` gets before escalation to `SIGKILL`.
    #[serde(skip)]
    pub kill_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_instances: MAX_INSTANCES,
            base_port: BASE_DEBUG_PORT,
            health_check_interval: Duration::from_secs(30),
            auto_restart: true,
            max_restart_attempts: 3,
            temp_root: None,
            startup_grace: Duration::from_millis(500),
            kill_grace: Duration::from_secs(10),
        }
    }
}

impl RegistryConfig {
    /// `$TMPDIR`, then `$TMP`, then `/tmp`, joined with `cdp_chrome`.
    pub fn resolved_temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(default_temp_root)
    }

    /// Instance defaults carrying the registry's restart policy.
    pub fn instance_defaults(&self) -> InstanceConfig {
        InstanceConfig {
            auto_restart: self.auto_restart,
            max_restart_attempts: self.max_restart_attempts,
            ..InstanceConfig::default()
        }
    }
}

pub fn default_temp_root() -> PathBuf {
    let base = ["TMPDIR", "TMP"]
        .iter()
        .filter_map(|key| env::var_os(key))
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join(TEMP_DIR_NAME)
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_humantime_interval() {
        let config: RegistryConfig =
            serde_json::from_str(r#"{"health_check_interval": "1m 30s", "max_instances": 4}"#)
                .unwrap();
        assert_eq!(config.health_check_interval, Duration::from_secs(90));
        assert_eq!(config.max_instances, 4);
        assert_eq!(config.base_port, BASE_DEBUG_PORT);
        assert_eq!(config.kill_grace, Duration::from_secs(10));
    }

    #[test]
    fn rejects_bad_interval() {
        let parsed: Result<RegistryConfig, _> =
            serde_json::from_str(r#"{"health_check_interval": "soon"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn explicit_temp_root_wins() {
        let config = RegistryConfig {
            temp_root: Some(PathBuf::from("/var/tmp/cdp")),
            ..RegistryConfig::default()
        };
        assert_eq!(config.resolved_temp_root(), PathBuf::from("/var/tmp/cdp"));
        assert!(default_temp_root().ends_with(TEMP_DIR_NAME));
    }
}
