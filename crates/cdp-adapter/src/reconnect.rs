//! Bounded exponential-backoff reconnection.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::TransportConfig;
use crate::error::{AdapterError, AdapterErrorKind, AdapterResult};
use crate::metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnState::Connected => "connected",
            ConnState::Disconnected => "disconnected",
            ConnState::Reconnecting => "reconnecting",
            ConnState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(cfg: &TransportConfig) -> Self {
        Self {
            max_attempts: cfg.max_reconnect_attempts,
            base_delay: Duration::from_millis(cfg.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(cfg.reconnect_max_delay_ms),
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max_delay`. Attempts count from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Tracks connection state and drives reconnect attempts for one attachment.
pub struct Reconnector {
    policy: ReconnectPolicy,
    port: u16,
    state: Mutex<ConnState>,
    attempts: AtomicU32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy, port: u16) -> Self {
        Self {
            policy,
            port,
            state: Mutex::new(ConnState::Connected),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn mark_connected(&self) {
        *self.state.lock() = ConnState::Connected;
        self.attempts.store(0, Ordering::Release);
    }

    pub fn mark_disconnected(&self) {
        let mut state = self.state.lock();
        if *state == ConnState::Connected {
            *state = ConnState::Disconnected;
        }
    }

    /// Run `connect` until it succeeds or the attempt budget is spent.
    ///
    /// Each attempt waits `delay_for(attempt)` first. On success the counter
    /// resets and the state returns to `Connected`; once the budget is spent
    /// the state is `Failed` and a `ReconnectExhausted` error is returned.
    pub fn reconnect_with_backoff<T, F>(&self, mut connect: F) -> AdapterResult<T>
    where
        F: FnMut(u32) -> AdapterResult<T>,
    {
        *self.state.lock() = ConnState::Reconnecting;
        self.attempts.store(0, Ordering::Release);

        let mut last_error = None;
        for attempt in 1..=self.policy.max_attempts {
            self.attempts.store(attempt, Ordering::Release);
            let delay = self.policy.delay_for(attempt);
            info!(
                target: "cdp-reconnect",
                attempt,
                max = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            thread::sleep(delay);
            metrics::record_reconnect_attempt();

            match connect(attempt) {
                Ok(value) => {
                    self.mark_connected();
                    metrics::record_reconnect_success();
                    info!(target: "cdp-reconnect", attempt, "reconnected");
                    return Ok(value);
                }
                Err(err) => {
                    warn!(target: "cdp-reconnect", attempt, %err, "reconnect attempt failed");
                    last_error = Some(err);
                }
            }
        }

        *self.state.lock() = ConnState::Failed;
        metrics::record_reconnect_give_up();
        error!(target: "cdp-reconnect", "Max reconnection attempts reached. Giving up.");
        error!(target: "cdp-reconnect", "Check if Chrome is running on port {}", self.port);

        let mut err = AdapterError::new(AdapterErrorKind::ReconnectExhausted).with_hint(format!(
            "max reconnection attempts ({}) reached; check if Chrome is running on port {}",
            self.policy.max_attempts, self.port
        ));
        if let Some(last) = last_error {
            err = err.with_data(serde_json::json!({ "last_error": last.to_string() }));
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::testing::closed_port;
    use crate::transport::Transport;
    use std::time::Instant;

    fn policy(max_attempts: u32, base_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(30_000),
        }
    }

    #[test]
    fn delays_grow_geometrically_and_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(30_000));
    }

    #[test]
    fn gives_up_after_budget_against_closed_endpoint() {
        let port = closed_port();
        let endpoint = Endpoint::new("127.0.0.1", port);
        let reconnector = Reconnector::new(policy(3, 20), port);
        let cfg = TransportConfig::default();

        let mut calls = 0;
        let started = Instant::now();
        let result = reconnector.reconnect_with_backoff(|_| {
            calls += 1;
            Transport::connect(&endpoint, "browser/x", &cfg)
        });
        let elapsed = started.elapsed();

        let err = result.err().expect("must give up");
        assert_eq!(err.kind, AdapterErrorKind::ReconnectExhausted);
        assert!(err
            .hint
            .as_deref()
            .unwrap_or_default()
            .contains(&format!("port {port}")));
        assert_eq!(calls, 3);
        assert_eq!(reconnector.state(), ConnState::Failed);
        assert!(elapsed >= Duration::from_millis(20 + 2 * 20));
    }

    #[test]
    fn success_resets_counter() {
        let reconnector = Reconnector::new(policy(5, 1), 9222);
        reconnector.mark_disconnected();
        assert_eq!(reconnector.state(), ConnState::Disconnected);

        let value = reconnector
            .reconnect_with_backoff(|attempt| {
                if attempt < 3 {
                    Err(AdapterError::new(AdapterErrorKind::ConnectionFailed))
                } else {
                    Ok(attempt)
                }
            })
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(reconnector.attempts(), 0);
        assert_eq!(reconnector.state(), ConnState::Connected);
    }
}
