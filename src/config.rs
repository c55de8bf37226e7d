//! Application configuration.
//!
//! One YAML document with a section per layer. Every field has a default, so
//! an empty file (or no file at all) is a valid configuration.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use cdp_adapter::config::{ChromeConfig, TransportConfig};
use cdpctl_registry::RegistryConfig;
use cdpctl_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const LOCAL_CONFIG_PATH: &str = "config/cdpctl.yaml";
pub const LOCAL_ENV_PATH: &str = "config/local.env";
pub const PORT_ENV: &str = "CDPCTL_PORT";
pub const CHROME_PATH_ENV: &str = "CDP_CHROME_PATH";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub chrome: ChromeConfig,
    pub transport: TransportConfig,
    pub registry: RegistryConfig,
    pub scheduler: SchedulerConfig,
    pub http: HttpConfig,
}

impl AppConfig {
    /// Environment wins over the file for the knobs the supervisor documents.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var(PORT_ENV) {
            match raw.trim().parse::<u16>() {
                Ok(port) if port > 0 => self.chrome.port = port,
                _ => warn!(value = %raw, "ignoring invalid {}", PORT_ENV),
            }
        }
        if let Some(path) = env::var_os(CHROME_PATH_ENV) {
            if !path.is_empty() {
                self.chrome.executable = Some(PathBuf::from(path));
            }
        }
        if matches!(env::var("CDP_NOLAUNCH_CHROME").as_deref(), Ok("1")) {
            self.chrome.auto_launch = false;
        }
    }

    /// Reject values the layers below would misbehave on.
    pub fn validate(&self) -> Result<()> {
        if self.chrome.port == 0 {
            bail!("chrome.port must be non-zero");
        }
        if self.transport.max_payload == 0 {
            bail!("transport.max_payload must be non-zero");
        }
        if self.transport.reconnect_base_delay_ms > self.transport.reconnect_max_delay_ms {
            bail!(
                "transport.reconnect_base_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                self.transport.reconnect_base_delay_ms,
                self.transport.reconnect_max_delay_ms
            );
        }
        if self.registry.max_instances == 0 {
            bail!("registry.max_instances must be at least 1");
        }
        if self.registry.health_check_interval.is_zero() {
            bail!("registry.health_check_interval must be positive");
        }
        if self.scheduler.workers == 0 {
            bail!("scheduler.workers must be at least 1");
        }
        if self.scheduler.queue_capacity == 0 {
            bail!("scheduler.queue_capacity must be at least 1");
        }
        Ok(())
    }
}

pub struct LoadedConfig {
    pub config: AppConfig,
    pub path: PathBuf,
    pub from_file: bool,
}

/// `--config` > `./config/cdpctl.yaml` > `<config dir>/cdpctl/config.yaml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let local = PathBuf::from(LOCAL_CONFIG_PATH);
    if local.exists() {
        return Ok(local);
    }
    let mut path = dirs::config_dir().context("Failed to get config directory")?;
    path.push("cdpctl");
    path.push("config.yaml");
    Ok(path)
}

pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let path = resolve_config_path(explicit)?;
    if !path.exists() {
        if explicit.is_some() {
            bail!("config file {} does not exist", path.display());
        }
        warn!(path = %path.display(), "Config file not found, using defaults");
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        return Ok(LoadedConfig {
            config,
            path,
            from_file: false,
        });
    }

    let mut config = parse_config_file(&path)?;
    config.apply_env_overrides();
    info!(path = %path.display(), "Loaded configuration");
    Ok(LoadedConfig {
        config,
        path,
        from_file: true,
    })
}

pub fn parse_config_file(path: &Path) -> Result<AppConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_config_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_config_str(raw: &str) -> Result<AppConfig> {
    if raw.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    Ok(serde_yaml::from_str(raw)?)
}

/// Read `KEY=VALUE` lines from `config/local.env` without clobbering the
/// process environment.
pub fn load_local_env_overrides(path: &Path) -> usize {
    if !path.exists() {
        return 0;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), ?err, "failed to read local.env overrides");
            return 0;
        }
    };

    let mut applied = 0;
    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!(line = idx + 1, "invalid local.env entry; skipping");
            continue;
        };
        let key = key.trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue;
        }
        env::set_var(key, unescape_value(value.trim()));
        applied += 1;
    }
    applied
}

fn unescape_value(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1]
            .replace("\\\"", "\"")
            .replace("\\n", "\n")
            .replace("\\r", "\r")
            .replace("\\t", "\t")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = parse_config_str("").unwrap();
        assert_eq!(config.http, HttpConfig::default());
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.registry.max_instances, 32);
        assert_eq!(config.scheduler.workers, 4);
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = parse_config_str(
            r#"
chrome:
  port: 9333
  headless: false
registry:
  health_check_interval: 5s
scheduler:
  strategy: least_loaded
http:
  port: 9000
"#,
        )
        .unwrap();
        assert_eq!(config.chrome.port, 9333);
        assert!(!config.chrome.headless);
        assert_eq!(config.chrome.host, "127.0.0.1");
        assert_eq!(config.registry.health_check_interval, Duration::from_secs(5));
        assert_eq!(
            config.scheduler.strategy,
            cdpctl_scheduler::Strategy::LeastLoaded
        );
        assert_eq!(config.http.port, 9000);
        assert_eq!(config.http.bind, "127.0.0.1");
    }

    #[test]
    fn validation_rejects_inverted_backoff() {
        let mut config = AppConfig::default();
        config.transport.reconnect_base_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.scheduler.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn env_overrides_port_and_launch() {
        env::set_var(PORT_ENV, "9444");
        env::set_var("CDP_NOLAUNCH_CHROME", "1");
        env::set_var(CHROME_PATH_ENV, "/opt/chrome/chrome");
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        env::remove_var(PORT_ENV);
        env::remove_var("CDP_NOLAUNCH_CHROME");
        env::remove_var(CHROME_PATH_ENV);

        assert_eq!(config.chrome.port, 9444);
        assert!(!config.chrome.auto_launch);
        assert_eq!(
            config.chrome.executable.as_deref(),
            Some(Path::new("/opt/chrome/chrome"))
        );
    }

    #[test]
    #[serial]
    fn local_env_does_not_override_existing_vars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.env");
        std::fs::write(
            &path,
            "# comment\nCDPCTL_TEST_FRESH=\"a\\tb\"\nCDPCTL_TEST_SET=file\nbroken line\n",
        )
        .unwrap();
        env::set_var("CDPCTL_TEST_SET", "process");
        env::remove_var("CDPCTL_TEST_FRESH");

        assert_eq!(load_local_env_overrides(&path), 1);
        assert_eq!(env::var("CDPCTL_TEST_FRESH").unwrap(), "a\tb");
        assert_eq!(env::var("CDPCTL_TEST_SET").unwrap(), "process");

        env::remove_var("CDPCTL_TEST_FRESH");
        env::remove_var("CDPCTL_TEST_SET");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(load_config(Some(&missing)).is_err());
    }
}
