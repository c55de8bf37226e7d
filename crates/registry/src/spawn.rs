//! Argument assembly and process spawning for registry-managed instances.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use cdp_adapter::supervisor::find_executable;
use tracing::debug;

use crate::errors::{RegistryError, RegistryResult};
use crate::model::InstanceConfig;

/// Ordered Chrome flag list for one registry instance.
pub fn instance_launch_args(
    config: &InstanceConfig,
    debug_port: u16,
    user_data_dir: &Path,
) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={debug_port}"),
        format!("--user-data-dir={}", user_data_dir.display()),
        format!(
            "--window-size={},{}",
            config.window_width, config.window_height
        ),
    ];
    let toggles = [
        (config.headless, "--headless"),
        (config.no_sandbox, "--no-sandbox"),
        (config.disable_gpu, "--disable-gpu"),
        (config.disable_dev_shm_usage, "--disable-dev-shm-usage"),
        (config.incognito, "--incognito"),
    ];
    args.extend(
        toggles
            .iter()
            .filter(|(enabled, _)| *enabled)
            .map(|(_, flag)| flag.to_string()),
    );
    args.extend(
        [
            "--disable-background-timer-throttling",
            "--disable-backgrounding-occluded-windows",
            "--disable-renderer-backgrounding",
            "--disable-features=TranslateUI",
            "--disable-ipc-flooding-protection",
            "--no-first-run",
            "--no-default-browser-check",
        ]
        .into_iter()
        .map(String::from),
    );
    if let Some(proxy) = non_blank(&config.proxy_server) {
        args.push(format!("--proxy-server={proxy}"));
    }
    if let Some(agent) = non_blank(&config.user_agent) {
        args.push(format!("--user-agent={agent}"));
    }
    args.push(format!("--max_old_space_size={}", config.memory_limit_mb));
    if let Some(extra) = non_blank(&config.extra_flags) {
        args.extend(extra.split_whitespace().map(String::from));
    }
    args.push("about:blank".to_string());
    args
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Starts the OS process behind an instance.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, args: &[String]) -> RegistryResult<Child>;
}

/// Spawns a real Chrome/Chromium binary.
#[derive(Clone, Debug, Default)]
pub struct ChromeSpawner {
    executable: Option<PathBuf>,
}

impl ChromeSpawner {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self { executable }
    }

    fn resolve(&self) -> RegistryResult<PathBuf> {
        self.executable
            .clone()
            .or_else(find_executable)
            .ok_or_else(|| RegistryError::LaunchFailed("Chrome executable not found".into()))
    }
}

impl ProcessSpawner for ChromeSpawner {
    fn spawn(&self, args: &[String]) -> RegistryResult<Child> {
        let executable = self.resolve()?;
        debug!(target: "cdp-registry", path = %executable.display(), ?args, "spawning chrome");
        Command::new(&executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                RegistryError::LaunchFailed(format!("{}: {err}", executable.display()))
            })
    }
}

/// Runs a fixed command and ignores the Chrome arguments. Used to stand in for
/// a browser where only process lifecycle matters.
#[derive(Clone, Debug)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, _args: &[String]) -> RegistryResult<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                RegistryError::LaunchFailed(format!("{}: {err}", self.program.display()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_in_order() {
        let config = InstanceConfig {
            user_agent: None,
            ..InstanceConfig::default()
        };
        let args = instance_launch_args(&config, 9230, Path::new("/tmp/cdp_chrome/chrome_instance_4"));
        assert_eq!(
            args,
            vec![
                "--remote-debugging-port=9230",
                "--user-data-dir=/tmp/cdp_chrome/chrome_instance_4",
                "--window-size=1280,720",
                "--headless",
                "--no-sandbox",
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--disable-background-timer-throttling",
                "--disable-backgrounding-occluded-windows",
                "--disable-renderer-backgrounding",
                "--disable-features=TranslateUI",
                "--disable-ipc-flooding-protection",
                "--no-first-run",
                "--no-default-browser-check",
                "--max_old_space_size=512",
                "about:blank",
            ]
        );
    }

    #[test]
    fn optional_flags() {
        let config = InstanceConfig {
            headless: false,
            incognito: true,
            proxy_server: Some("http://127.0.0.1:3128".into()),
            user_agent: Some("agent/1".into()),
            extra_flags: Some("  --mute-audio   --lang=en ".into()),
            ..InstanceConfig::default()
        };
        let args = instance_launch_args(&config, 9300, Path::new("/p"));
        assert!(!args.contains(&"--headless".to_string()));
        assert!(args.contains(&"--incognito".to_string()));
        let tail: Vec<_> = args.iter().rev().take(6).rev().cloned().collect();
        assert_eq!(
            tail,
            vec![
                "--proxy-server=http://127.0.0.1:3128",
                "--user-agent=agent/1",
                "--max_old_space_size=512",
                "--mute-audio",
                "--lang=en",
                "about:blank",
            ]
        );
    }

    #[test]
    fn missing_program_is_a_launch_failure() {
        let spawner = CommandSpawner::new("/nonexistent/cdpctl-browser", &[]);
        assert!(matches!(
            spawner.spawn(&[]),
            Err(RegistryError::LaunchFailed(_))
        ));
    }
}
