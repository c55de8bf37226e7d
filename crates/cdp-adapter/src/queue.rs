//! Bounded queue of fire-and-track commands served by one worker thread.
//!
//! The worker writes pending commands, pumps the socket into the response
//! bus, completes sent commands whose reply has arrived and expires the ones
//! that waited too long. Finished entries stay visible to [`CommandQueue::wait`]
//! and [`CommandQueue::stats`] until their slot is needed again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dispatch::{build_envelope, Dispatcher};
use crate::error::{AdapterError, AdapterErrorKind, AdapterResult};
use crate::metrics;

pub const QUEUE_CAPACITY: usize = 100;
pub const ASYNC_TIMEOUT_MS: u64 = 30_000;

const PUMP_SLICE: Duration = Duration::from_millis(100);
const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Sent,
    Completed,
    Failed,
    Timeout,
}

impl CommandState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Failed | CommandState::Timeout
        )
    }
}

/// Final (or current) view of a queued command.
#[derive(Clone, Debug, Serialize)]
pub struct CommandOutcome {
    pub id: u64,
    pub method: String,
    pub state: CommandState,
    /// Raw reply on completion, a short reason on failure or timeout.
    pub response: Option<String>,
}

/// Called once with the final outcome. User data travels in the closure.
pub type CompletionCallback = Box<dyn FnOnce(&CommandOutcome) + Send>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

struct AsyncCommand {
    id: u64,
    method: String,
    envelope: String,
    state: CommandState,
    response: Option<String>,
    sent_at: Option<Instant>,
    timeout: Duration,
    callback: Option<CompletionCallback>,
}

impl AsyncCommand {
    fn outcome(&self) -> CommandOutcome {
        CommandOutcome {
            id: self.id,
            method: self.method.clone(),
            state: self.state,
            response: self.response.clone(),
        }
    }

    /// Move to a final state; hands back the callback to run outside the lock.
    fn finish(
        &mut self,
        state: CommandState,
        response: String,
    ) -> Option<(CompletionCallback, CommandOutcome)> {
        self.state = state;
        self.response = Some(response);
        let outcome = self.outcome();
        self.callback.take().map(|callback| (callback, outcome))
    }
}

struct Shared {
    commands: Mutex<VecDeque<AsyncCommand>>,
    changed: Condvar,
    running: AtomicBool,
    capacity: usize,
}

pub struct CommandQueue {
    dispatcher: Arc<Dispatcher>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    pub fn start(dispatcher: Arc<Dispatcher>) -> AdapterResult<Self> {
        Self::with_capacity(dispatcher, QUEUE_CAPACITY)
    }

    pub fn with_capacity(dispatcher: Arc<Dispatcher>, capacity: usize) -> AdapterResult<Self> {
        let shared = Arc::new(Shared {
            commands: Mutex::new(VecDeque::with_capacity(capacity)),
            changed: Condvar::new(),
            running: AtomicBool::new(true),
            capacity: capacity.max(1),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_dispatcher = Arc::clone(&dispatcher);
        let worker = thread::Builder::new()
            .name("cdp-queue".to_string())
            .spawn(move || worker_loop(&worker_dispatcher, &worker_shared))
            .map_err(|err| AdapterError::io(AdapterErrorKind::Internal, &err))?;
        info!(target: "cdp-queue", capacity = shared.capacity, "command queue started");

        Ok(Self {
            dispatcher,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a command. `timeout_ms <= 0` selects the 30 s default.
    pub fn submit(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: i64,
        callback: Option<CompletionCallback>,
    ) -> AdapterResult<u64> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(AdapterError::new(AdapterErrorKind::Internal)
                .with_hint("command queue is shut down"));
        }

        let mut commands = self.shared.commands.lock();
        if commands.len() >= self.shared.capacity {
            // recycle the oldest finished slot
            match commands.iter().position(|cmd| cmd.state.is_final()) {
                Some(pos) => {
                    commands.remove(pos);
                }
                None => {
                    return Err(AdapterError::new(AdapterErrorKind::QueueFull)
                        .with_hint(format!(
                            "command queue is full ({} in flight)",
                            self.shared.capacity
                        ))
                        .retriable(true));
                }
            }
        }

        let id = self.dispatcher.ids().next();
        let timeout = if timeout_ms > 0 {
            Duration::from_millis(timeout_ms as u64)
        } else {
            Duration::from_millis(ASYNC_TIMEOUT_MS)
        };
        commands.push_back(AsyncCommand {
            id,
            method: method.to_string(),
            envelope: build_envelope(id, method, params.as_ref()),
            state: CommandState::Pending,
            response: None,
            sent_at: None,
            timeout,
            callback,
        });
        drop(commands);

        self.shared.changed.notify_all();
        debug!(target: "cdp-queue", id, method, "command queued");
        Ok(id)
    }

    pub fn state(&self, id: u64) -> Option<CommandState> {
        self.shared
            .commands
            .lock()
            .iter()
            .find(|cmd| cmd.id == id)
            .map(|cmd| cmd.state)
    }

    /// Block until the command reaches a final state.
    pub fn wait(&self, id: u64, timeout: Duration) -> AdapterResult<CommandOutcome> {
        let deadline = Instant::now() + timeout;
        let mut commands = self.shared.commands.lock();
        loop {
            let Some(cmd) = commands.iter().find(|cmd| cmd.id == id) else {
                return Err(AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint(format!("command {id} is not queued")));
            };
            if cmd.state.is_final() {
                return Ok(cmd.outcome());
            }
            if self
                .shared
                .changed
                .wait_until(&mut commands, deadline)
                .timed_out()
            {
                return Err(AdapterError::new(AdapterErrorKind::ReplyTimeout)
                    .with_hint(format!("command {id} still in flight"))
                    .retriable(true));
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let commands = self.shared.commands.lock();
        let mut stats = QueueStats::default();
        for cmd in commands.iter() {
            match cmd.state {
                CommandState::Pending | CommandState::Sent => stats.pending += 1,
                CommandState::Completed => stats.completed += 1,
                CommandState::Failed | CommandState::Timeout => stats.failed += 1,
            }
        }
        stats
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.changed.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        info!(target: "cdp-queue", "command queue stopped");
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(dispatcher: &Dispatcher, shared: &Shared) {
    while shared.running.load(Ordering::Acquire) {
        {
            let mut commands = shared.commands.lock();
            if !commands.iter().any(|cmd| !cmd.state.is_final()) {
                shared.changed.wait_for(&mut commands, IDLE_WAIT);
                continue;
            }
        }
        process_round(dispatcher, shared);
    }
}

fn process_round(dispatcher: &Dispatcher, shared: &Shared) {
    let mut finished = Vec::new();

    let to_send: Vec<(u64, String)> = shared
        .commands
        .lock()
        .iter()
        .filter(|cmd| cmd.state == CommandState::Pending)
        .map(|cmd| (cmd.id, cmd.envelope.clone()))
        .collect();

    for (id, envelope) in to_send {
        let sent = dispatcher.send_command_with_retry(&envelope);
        let mut commands = shared.commands.lock();
        let Some(cmd) = commands.iter_mut().find(|cmd| cmd.id == id) else {
            continue;
        };
        match sent {
            Ok(_) => {
                metrics::record_command(&cmd.method);
                cmd.state = CommandState::Sent;
                cmd.sent_at = Some(Instant::now());
            }
            Err(err) => {
                warn!(target: "cdp-queue", id, %err, "send failed");
                metrics::record_command_failure(&cmd.method);
                finished.extend(cmd.finish(CommandState::Failed, format!("Failed to send command: {err}")));
            }
        }
    }

    if let Err(err) = dispatcher.pump_once(PUMP_SLICE) {
        warn!(target: "cdp-queue", %err, "pump failed");
        thread::sleep(PUMP_SLICE);
    }

    {
        let mut commands = shared.commands.lock();
        for cmd in commands
            .iter_mut()
            .filter(|cmd| cmd.state == CommandState::Sent)
        {
            let sent_at = cmd.sent_at.unwrap_or_else(Instant::now);
            if let Some(reply) = dispatcher.bus().try_get(cmd.id) {
                metrics::record_command_success(&cmd.method, sent_at.elapsed());
                finished.extend(cmd.finish(CommandState::Completed, reply));
            } else if sent_at.elapsed() > cmd.timeout {
                warn!(
                    target: "cdp-queue",
                    id = cmd.id,
                    timeout_ms = cmd.timeout.as_millis() as u64,
                    "command timed out"
                );
                metrics::record_command_failure(&cmd.method);
                finished.extend(cmd.finish(CommandState::Timeout, "Command timed out".to_string()));
            }
        }
    }
    shared.changed.notify_all();

    for (callback, outcome) in finished {
        callback(&outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ResponseBus;
    use crate::config::TransportConfig;
    use crate::dispatch::CommandIds;
    use crate::testing::FakeChrome;
    use std::sync::mpsc;

    fn queue_for(chrome: &FakeChrome, capacity: usize) -> CommandQueue {
        let dispatcher = Dispatcher::connect(
            chrome.endpoint(),
            "browser/q",
            TransportConfig::default(),
            Arc::new(CommandIds::new()),
            Arc::new(ResponseBus::new()),
        )
        .unwrap();
        CommandQueue::with_capacity(Arc::new(dispatcher), capacity).unwrap()
    }

    #[test]
    fn completes_and_invokes_callback() {
        let chrome = FakeChrome::start();
        let queue = queue_for(&chrome, 8);
        let (tx, rx) = mpsc::channel();
        let id = queue
            .submit(
                "Browser.getVersion",
                None,
                0,
                Some(Box::new(move |outcome| {
                    let _ = tx.send(outcome.clone());
                })),
            )
            .unwrap();

        let outcome = queue.wait(id, Duration::from_secs(3)).unwrap();
        assert_eq!(outcome.state, CommandState::Completed);
        assert!(outcome.response.unwrap().contains("Browser.getVersion"));

        let notified = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(notified.id, id);
        assert_eq!(queue.stats().completed, 1);
    }

    #[test]
    fn silent_command_times_out() {
        let chrome = FakeChrome::start();
        let queue = queue_for(&chrome, 8);
        let id = queue.submit("Test.silent", None, 150, None).unwrap();
        let outcome = queue.wait(id, Duration::from_secs(3)).unwrap();
        assert_eq!(outcome.state, CommandState::Timeout);
        assert_eq!(outcome.response.as_deref(), Some("Command timed out"));
        assert_eq!(
            queue.stats(),
            QueueStats {
                pending: 0,
                completed: 0,
                failed: 1
            }
        );
    }

    #[test]
    fn full_queue_rejects_until_a_slot_finishes() {
        let chrome = FakeChrome::start();
        let queue = queue_for(&chrome, 2);
        queue.submit("Test.silent", None, 60_000, None).unwrap();
        let quick = queue.submit("Browser.getVersion", None, 0, None).unwrap();
        queue.wait(quick, Duration::from_secs(3)).unwrap();

        // the finished slot is recycled, then the queue is genuinely full
        queue.submit("Test.silent", None, 60_000, None).unwrap();
        let err = queue
            .submit("Test.silent", None, 60_000, None)
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::QueueFull);
        assert_eq!(queue.stats().pending, 2);
    }

    #[test]
    fn shutdown_refuses_new_work() {
        let chrome = FakeChrome::start();
        let queue = queue_for(&chrome, 4);
        queue.shutdown();
        assert!(queue.submit("Browser.getVersion", None, 0, None).is_err());
    }
}
