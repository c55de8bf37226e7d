//! Chrome DevTools Protocol plumbing for cdpctl.
//!
//! The crate is layered leaves first: [`frame`] encodes and decodes RFC 6455
//! frames, [`transport`] owns one WebSocket to a CDP target, [`bus`] correlates
//! reply ids with waiting callers, [`dispatch`] builds envelopes and blocks for
//! replies, and [`reconnect`] restores a dead socket with bounded backoff.
//! [`supervisor`] finds and launches the browser the transport talks to.

pub mod bus;
pub mod dispatch;
pub mod frame;
pub mod metrics;
pub mod queue;
pub mod reconnect;
pub mod reply;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod transport;

pub use bus::{BusCallback, ResponseBus, StoreOutcome};
pub use dispatch::{CommandIds, Dispatcher, PendingReply, PumpHandle};
pub use error::{AdapterError, AdapterErrorKind, AdapterResult};
pub use queue::{CommandOutcome, CommandQueue, CommandState, QueueStats};
pub use reconnect::{ConnState, ReconnectPolicy, Reconnector};
pub use reply::{DomainError, Reply};
pub use supervisor::{
    create_new_page, discover_browser_target, find_executable, is_port_open, list_targets,
    ChromeSupervisor, EnsureOutcome, LaunchArgs,
};
pub use transport::{connect_chrome_websocket, Transport};

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// Failure categories surfaced by the transport, correlation and supervisor layers.
    #[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AdapterErrorKind {
        #[error("connection failed")]
        ConnectionFailed,
        #[error("websocket handshake rejected")]
        HandshakeRejected,
        #[error("protocol violation")]
        ProtocolViolation,
        #[error("payload too large")]
        PayloadTooLarge,
        #[error("connection closed")]
        ConnectionClosed,
        #[error("send failed")]
        SendFailed,
        #[error("reply timed out")]
        ReplyTimeout,
        #[error("cdp returned an error")]
        DomainError,
        #[error("reconnect attempts exhausted")]
        ReconnectExhausted,
        #[error("chrome executable not found")]
        ExecutableNotFound,
        #[error("chrome launch failed")]
        LaunchFailed,
        #[error("command queue full")]
        QueueFull,
        #[error("internal error")]
        Internal,
    }

    /// Enriched error metadata passed back to higher layers.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AdapterError {
        pub kind: AdapterErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
        pub data: Option<serde_json::Value>,
    }

    pub type AdapterResult<T> = Result<T, AdapterError>;

    impl fmt::Display for AdapterError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for AdapterError {}

    impl AdapterError {
        pub fn new(kind: AdapterErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
                data: None,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }

        pub fn io(kind: AdapterErrorKind, err: &std::io::Error) -> Self {
            Self::new(kind).with_hint(err.to_string())
        }

        /// The browser answered, but with an `error` or `exceptionDetails` payload.
        pub fn is_domain(&self) -> bool {
            matches!(self.kind, AdapterErrorKind::DomainError)
        }

        /// Socket, framing or correlation failures; the browser never answered.
        pub fn is_transport(&self) -> bool {
            matches!(
                self.kind,
                AdapterErrorKind::ConnectionFailed
                    | AdapterErrorKind::HandshakeRejected
                    | AdapterErrorKind::ProtocolViolation
                    | AdapterErrorKind::PayloadTooLarge
                    | AdapterErrorKind::ConnectionClosed
                    | AdapterErrorKind::SendFailed
                    | AdapterErrorKind::ReplyTimeout
                    | AdapterErrorKind::ReconnectExhausted
            )
        }

        /// Errors after which the socket can no longer be trusted.
        pub fn is_connection_dead(&self) -> bool {
            matches!(
                self.kind,
                AdapterErrorKind::ConnectionClosed
                    | AdapterErrorKind::ProtocolViolation
                    | AdapterErrorKind::SendFailed
            )
        }
    }
}

pub mod config {
    use serde::{Deserialize, Serialize};
    use std::{env, path::PathBuf, time::Duration};

    pub const CHROME_DEFAULT_HOST: &str = "127.0.0.1";
    pub const CHROME_DEFAULT_PORT: u16 = 9222;
    pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
    pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
    pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    pub const SEND_RETRIES: u32 = 3;
    pub const WS_MAX_PAYLOAD_SIZE: usize = 65_536;
    pub const RECEIVE_BUDGET: usize = 10;
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Where the DevTools HTTP/WebSocket server listens.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Endpoint {
        pub host: String,
        pub port: u16,
    }

    impl Endpoint {
        pub fn new(host: impl Into<String>, port: u16) -> Self {
            Self {
                host: host.into(),
                port,
            }
        }

        pub fn authority(&self) -> String {
            format!("{}:{}", self.host, self.port)
        }
    }

    impl Default for Endpoint {
        fn default() -> Self {
            Self::new(CHROME_DEFAULT_HOST, CHROME_DEFAULT_PORT)
        }
    }

    /// Tuning for the socket, correlation and reconnect layers.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TransportConfig {
        pub default_timeout_ms: u64,
        pub connect_timeout_ms: u64,
        pub max_reconnect_attempts: u32,
        pub reconnect_base_delay_ms: u64,
        pub reconnect_max_delay_ms: u64,
        pub send_retries: u32,
        pub max_payload: usize,
        pub receive_budget: usize,
    }

    impl Default for TransportConfig {
        fn default() -> Self {
            Self {
                default_timeout_ms: DEFAULT_TIMEOUT_MS,
                connect_timeout_ms: CONNECT_TIMEOUT_MS,
                max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
                reconnect_base_delay_ms: RECONNECT_BASE_DELAY_MS,
                reconnect_max_delay_ms: RECONNECT_MAX_DELAY_MS,
                send_retries: SEND_RETRIES,
                max_payload: WS_MAX_PAYLOAD_SIZE,
                receive_budget: RECEIVE_BUDGET,
            }
        }
    }

    impl TransportConfig {
        /// `timeout_ms <= 0` selects the configured default.
        pub fn resolve_timeout(&self, timeout_ms: i64) -> Duration {
            if timeout_ms <= 0 {
                Duration::from_millis(self.default_timeout_ms)
            } else {
                Duration::from_millis(timeout_ms as u64)
            }
        }

        pub fn connect_timeout(&self) -> Duration {
            Duration::from_millis(self.connect_timeout_ms)
        }
    }

    /// How the browser is located and launched.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ChromeConfig {
        pub host: String,
        pub port: u16,
        pub executable: Option<PathBuf>,
        pub user_data_dir: Option<PathBuf>,
        pub headless: bool,
        pub proxy: Option<String>,
        pub verbose: bool,
        pub auto_launch: bool,
    }

    impl Default for ChromeConfig {
        fn default() -> Self {
            Self {
                host: CHROME_DEFAULT_HOST.to_string(),
                port: resolve_port_default(),
                executable: None,
                user_data_dir: None,
                headless: env::var_os("CDP_GUI_MODE").is_none(),
                proxy: None,
                verbose: false,
                auto_launch: resolve_auto_launch_default(),
            }
        }
    }

    impl ChromeConfig {
        pub fn endpoint(&self) -> Endpoint {
            Endpoint::new(self.host.clone(), self.port)
        }

        /// Profile directory keyed by port so two browsers never share a profile lock.
        pub fn profile_dir(&self) -> PathBuf {
            match &self.user_data_dir {
                Some(dir) => dir.clone(),
                None => env::temp_dir().join(format!("cdp-chrome-profile-{}", self.port)),
            }
        }
    }

    fn resolve_port_default() -> u16 {
        env::var("CDPCTL_PORT")
            .ok()
            .and_then(|value| value.trim().parse::<u16>().ok())
            .unwrap_or(CHROME_DEFAULT_PORT)
    }

    fn resolve_auto_launch_default() -> bool {
        // CDP_NOLAUNCH_CHROME=1 leaves browser management to the user
        !matches!(env::var("CDP_NOLAUNCH_CHROME").as_deref(), Ok("1"))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn non_positive_timeout_uses_default() {
            let cfg = TransportConfig::default();
            assert_eq!(cfg.resolve_timeout(0), Duration::from_millis(5_000));
            assert_eq!(cfg.resolve_timeout(-7), Duration::from_millis(5_000));
            assert_eq!(cfg.resolve_timeout(250), Duration::from_millis(250));
        }

        #[test]
        fn profile_dir_is_keyed_by_port() {
            let cfg = ChromeConfig {
                port: 9333,
                ..ChromeConfig::default()
            };
            assert!(cfg
                .profile_dir()
                .to_string_lossy()
                .ends_with("cdp-chrome-profile-9333"));
        }
    }
}
