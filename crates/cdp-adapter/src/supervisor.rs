//! Locating, launching and relaunching the browser behind the debug port.

use std::env;
use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::blocking::{Client, Response};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use which::which;

use crate::config::{ChromeConfig, Endpoint, TransportConfig};
use crate::dispatch::{build_envelope, CommandIds, Dispatcher};
use crate::error::{AdapterError, AdapterErrorKind, AdapterResult};
use crate::transport::connect_chrome_websocket;

const PORT_CHECK_TIMEOUT: Duration = Duration::from_millis(100);
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PORT_POLL_ATTEMPTS: u32 = 100;
const VERIFY_ATTEMPTS: u32 = 30;
const REAP_EVERY: u32 = 5;
const CLOSE_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum EnsureOutcome {
    AlreadyRunning,
    Launched { pid: u32 },
    Relaunched { pid: u32 },
}

/// Ordered browser command line.
///
/// The flag bundle is kept literally as Chrome builds have been validated
/// against it; only the port, profile, mode and proxy vary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchArgs {
    port: u16,
    user_data_dir: PathBuf,
    headless: bool,
    proxy: Option<String>,
}

impl LaunchArgs {
    pub fn new(port: u16, user_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            port,
            user_data_dir: user_data_dir.into(),
            headless: true,
            proxy: None,
        }
    }

    pub fn from_config(cfg: &ChromeConfig) -> Self {
        Self::new(cfg.port, cfg.profile_dir())
            .headless(cfg.headless)
            .proxy(cfg.proxy.clone())
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn build(&self) -> Vec<String> {
        let mut args = vec![format!("--remote-debugging-port={}", self.port)];
        if let Some(proxy) = &self.proxy {
            args.push(format!("--proxy-server={proxy}"));
        }
        args.push("--no-sandbox".into());
        args.push("--disable-dev-shm-usage".into());
        if self.headless {
            args.push("--headless=new".into());
            args.push("--disable-gpu".into());
        }
        args.push(format!("--user-data-dir={}", self.user_data_dir.display()));
        args.push("--disable-extensions".into());
        args.push("--disable-background-timer-throttling".into());
        if self.headless {
            args.push("--disable-backgrounding-occluded-windows".into());
        }
        args.push("--disable-renderer-backgrounding".into());
        args.push("--disable-features=TranslateUI".into());
        args.push("--disable-ipc-flooding-protection".into());
        args.push("--no-first-run".into());
        if self.headless {
            args.push("--disable-default-apps".into());
            args.push("--disable-sync".into());
        }
        args.push("--enable-automation".into());
        if self.headless {
            args.push("--password-store=basic".into());
            args.push("--use-mock-keychain".into());
        }
        args.push("about:blank".into());
        args
    }
}

/// Find a Chrome/Chromium binary: `CDP_CHROME_PATH`, then well-known
/// install paths, then a `PATH` lookup.
pub fn find_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("CDP_CHROME_PATH") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if is_executable_file(&candidate) {
                return Some(candidate);
            }
            warn!(target: "cdp-supervisor", path = %candidate.display(), "CDP_CHROME_PATH is not an executable file");
        }
    }

    let skip_defaults = env::var("CDP_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    if !skip_defaults {
        if let Some(found) = os_specific_chrome_paths()
            .into_iter()
            .find(|candidate| is_executable_file(candidate))
        {
            return Some(found);
        }
    }

    chrome_executable_names()
        .iter()
        .filter_map(|name| which(name).ok())
        .find(|path| is_executable_file(path))
}

/// Regular file (after following links) with an execute bit.
pub fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chrome"]
    }

    #[cfg(not(target_os = "windows"))]
    {
        &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files\Chromium\Application\chrome.exe"),
        ];
        for key in ["LOCALAPPDATA", "PROGRAMFILES"] {
            if let Ok(root) = env::var(key) {
                paths.push(PathBuf::from(root).join(r"Google\Chrome\Application\chrome.exe"));
            }
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
            PathBuf::from(
                "/Applications/Google Chrome Canary.app/Contents/MacOS/Google Chrome Canary",
            ),
            PathBuf::from("/usr/local/bin/chromium"),
        ]
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // the direct binary first, to skip wrapper scripts
        vec![
            PathBuf::from("/opt/google/chrome/chrome"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/snap/bin/chromium"),
            PathBuf::from("/usr/local/bin/chrome"),
        ]
    }
}

/// TCP connect check bounded to 100 ms.
pub fn is_port_open(host: &str, port: u16) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, PORT_CHECK_TIMEOUT).is_ok())
}

/// Poll until the port accepts connections.
///
/// The launched process is reaped without blocking every few attempts; Chrome
/// commonly re-execs itself, so an early exit is logged and polling continues.
pub fn wait_for_port(
    host: &str,
    port: u16,
    interval: Duration,
    attempts: u32,
    mut child: Option<&mut Child>,
) -> bool {
    let mut child_exited = false;
    for attempt in 0..attempts {
        thread::sleep(interval);

        if !child_exited && attempt > 0 && attempt % REAP_EVERY == 0 {
            if let Some(child) = child.as_deref_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    child_exited = true;
                    debug!(target: "cdp-supervisor", %status, "launcher process exited; still polling");
                }
            }
        }

        if is_port_open(host, port) {
            return true;
        }
        if attempt == 30 {
            info!(target: "cdp-supervisor", port, "still waiting for Chrome to start");
        }
    }
    false
}

pub fn wait_for_port_closed(host: &str, port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_port_open(host, port) {
            return true;
        }
        thread::sleep(PORT_POLL_INTERVAL);
    }
    !is_port_open(host, port)
}

/// `GET /json/version` and return the browser target (`browser/<id>`).
pub fn discover_browser_target(endpoint: &Endpoint, cfg: &TransportConfig) -> AdapterResult<String> {
    let version = http_get_json(endpoint, cfg, "/json/version")?;
    let ws_url = version
        .get("webSocketDebuggerUrl")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::ProtocolViolation)
                .with_hint("/json/version has no webSocketDebuggerUrl")
        })?;
    target_from_ws_url(ws_url).ok_or_else(|| {
        AdapterError::new(AdapterErrorKind::ProtocolViolation)
            .with_hint(format!("unexpected debugger url {ws_url}"))
    })
}

/// `GET /json/list`: every target the browser exposes.
pub fn list_targets(endpoint: &Endpoint, cfg: &TransportConfig) -> AdapterResult<Vec<Value>> {
    match http_get_json(endpoint, cfg, "/json/list")? {
        Value::Array(items) => Ok(items),
        other => Err(AdapterError::new(AdapterErrorKind::ProtocolViolation)
            .with_hint("/json/list did not return an array")
            .with_data(other)),
    }
}

/// Open a blank page through a browser-level dispatcher and return its target id.
pub fn create_new_page(dispatcher: &Dispatcher) -> AdapterResult<String> {
    let reply = dispatcher.call_cmd(
        "Target.createTarget",
        Some(json!({ "url": "about:blank" })),
        0,
    )?;
    if let Some(domain) = reply.domain_error() {
        return Err(AdapterError::new(AdapterErrorKind::DomainError)
            .with_hint(domain.message)
            .with_data(reply.into_value()));
    }
    reply.target_id().map(str::to_string).ok_or_else(|| {
        AdapterError::new(AdapterErrorKind::ProtocolViolation)
            .with_hint("Target.createTarget reply has no targetId")
    })
}

fn target_from_ws_url(url: &str) -> Option<String> {
    let (_, tail) = url.split_once("/devtools/")?;
    (!tail.is_empty()).then(|| tail.to_string())
}

fn devtools_client(cfg: &TransportConfig) -> AdapterResult<Client> {
    // loopback only; an HTTP(S)_PROXY from the environment must not apply
    Client::builder()
        .connect_timeout(cfg.connect_timeout())
        .timeout(Duration::from_millis(cfg.default_timeout_ms))
        .no_proxy()
        .build()
        .map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("cannot build DevTools http client: {err}"))
        })
}

fn http_get_json(endpoint: &Endpoint, cfg: &TransportConfig, path: &str) -> AdapterResult<Value> {
    let url = format!("http://{}{path}", endpoint.authority());
    let response = devtools_client(cfg)?
        .get(&url)
        .send()
        .and_then(Response::error_for_status)
        .map_err(|err| http_error(path, err))?;
    response.json::<Value>().map_err(|err| {
        AdapterError::new(AdapterErrorKind::ProtocolViolation)
            .with_hint(format!("GET {path} returned invalid json: {err}"))
    })
}

fn http_error(path: &str, err: reqwest::Error) -> AdapterError {
    let retriable = err.is_connect() || err.is_timeout();
    AdapterError::new(AdapterErrorKind::ConnectionFailed)
        .with_hint(format!("GET {path}: {err}"))
        .retriable(retriable)
}

/// Keeps one browser listening on the configured debug port.
pub struct ChromeSupervisor {
    cfg: ChromeConfig,
    transport: TransportConfig,
    child: Mutex<Option<Child>>,
}

impl ChromeSupervisor {
    pub fn new(cfg: ChromeConfig, transport: TransportConfig) -> Self {
        Self {
            cfg,
            transport,
            child: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ChromeConfig {
        &self.cfg
    }

    pub fn endpoint(&self) -> Endpoint {
        self.cfg.endpoint()
    }

    pub fn is_running(&self) -> bool {
        is_port_open(&self.cfg.host, self.cfg.port)
    }

    /// Pid of the process this supervisor spawned, if any.
    pub fn child_pid(&self) -> Option<u32> {
        self.child.lock().as_ref().map(Child::id)
    }

    /// The configured executable, or discovery when none is configured.
    pub fn resolve_executable(&self) -> AdapterResult<PathBuf> {
        if let Some(configured) = &self.cfg.executable {
            if is_executable_file(configured) {
                return Ok(configured.clone());
            }
            return Err(AdapterError::new(AdapterErrorKind::ExecutableNotFound).with_hint(
                format!("{} is not an executable file", configured.display()),
            ));
        }
        find_executable().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::ExecutableNotFound).with_hint(
                "install Chrome or set CDP_CHROME_PATH; set CDP_NOLAUNCH_CHROME=1 to disable auto-launch",
            )
        })
    }

    /// Start the browser unless something already listens on the port.
    pub fn launch(&self) -> AdapterResult<EnsureOutcome> {
        if self.is_running() {
            info!(target: "cdp-supervisor", port = self.cfg.port, "Chrome already running");
            return Ok(EnsureOutcome::AlreadyRunning);
        }
        let pid = self.spawn_and_wait()?;
        Ok(EnsureOutcome::Launched { pid })
    }

    /// Idempotent: a listening port is left alone unless `relaunch` is set.
    pub fn ensure_running(&self, relaunch: bool, ids: &CommandIds) -> AdapterResult<EnsureOutcome> {
        let port = self.cfg.port;
        if self.is_running() {
            if !relaunch {
                return Ok(EnsureOutcome::AlreadyRunning);
            }
            if let Err(err) = self.close_browser(ids) {
                warn!(target: "cdp-supervisor", port, %err, "graceful Browser.close failed");
            }
            if !wait_for_port_closed(&self.cfg.host, port, CLOSE_WAIT) {
                return Err(AdapterError::new(AdapterErrorKind::LaunchFailed).with_hint(format!(
                    "port {port} still open {}s after Browser.close",
                    CLOSE_WAIT.as_secs()
                )));
            }
            let pid = self.spawn_and_wait()?;
            return Ok(EnsureOutcome::Relaunched { pid });
        }

        if !self.cfg.auto_launch {
            return Err(AdapterError::new(AdapterErrorKind::ConnectionFailed).with_hint(format!(
                "Chrome is not running on port {port}; start it with: chrome --remote-debugging-port={port} (auto-launch disabled by CDP_NOLAUNCH_CHROME=1)"
            )));
        }
        info!(target: "cdp-supervisor", port, "Chrome not found, auto-launching");
        let pid = self.spawn_and_wait()?;
        Ok(EnsureOutcome::Launched { pid })
    }

    /// Ask the running browser to exit over a short-lived browser connection.
    pub fn close_browser(&self, ids: &CommandIds) -> AdapterResult<()> {
        let endpoint = self.endpoint();
        let target = discover_browser_target(&endpoint, &self.transport)?;
        let transport = connect_chrome_websocket(&endpoint, &target, &self.transport, ids)?;
        transport.send_text(&build_envelope(ids.next(), "Browser.close", None))?;
        // the reply is best effort; the browser may drop the socket first
        let _ = transport.recv_text(Duration::from_millis(500));
        transport.close();
        info!(target: "cdp-supervisor", port = endpoint.port, "Browser.close sent");
        Ok(())
    }

    fn spawn_and_wait(&self) -> AdapterResult<u32> {
        let executable = self.resolve_executable()?;
        let args = LaunchArgs::from_config(&self.cfg).build();
        let port = self.cfg.port;

        let stderr = if self.cfg.verbose {
            Stdio::inherit()
        } else {
            Stdio::null()
        };
        let mut child = Command::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .map_err(|err| {
                AdapterError::io(AdapterErrorKind::LaunchFailed, &err)
                    .with_data(json!({ "executable": executable.display().to_string() }))
            })?;
        let pid = child.id();
        info!(
            target: "cdp-supervisor",
            pid,
            port,
            executable = %executable.display(),
            "Chrome launched"
        );

        let ready = wait_for_port(
            &self.cfg.host,
            port,
            PORT_POLL_INTERVAL,
            PORT_POLL_ATTEMPTS,
            Some(&mut child),
        ) || wait_for_port(&self.cfg.host, port, PORT_POLL_INTERVAL, VERIFY_ATTEMPTS, None);
        *self.child.lock() = Some(child);

        if !ready {
            warn!(target: "cdp-supervisor", pid, port, "Chrome did not open its debug port");
            return Err(AdapterError::new(AdapterErrorKind::LaunchFailed)
                .with_hint(format!(
                    "Chrome (pid {pid}) is not listening on port {port}; it may still be starting, try again in a few seconds"
                ))
                .retriable(true));
        }
        info!(target: "cdp-supervisor", pid, port, "Chrome DevTools listening");
        Ok(pid)
    }
}
