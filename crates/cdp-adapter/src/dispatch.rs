//! Command dispatch: envelopes out, correlated replies back.
//!
//! Every command gets its id from one shared [`CommandIds`] counter. Replies
//! are matched by id only; CDP does not promise arrival order, so anything
//! read on behalf of another caller is parked on the [`ResponseBus`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};
use tracing::{debug, error, trace, warn};

use crate::bus::{ResponseBus, StoreOutcome};
use crate::config::{Endpoint, TransportConfig};
use crate::error::{AdapterError, AdapterErrorKind, AdapterResult};
use crate::metrics;
use crate::reconnect::{ConnState, ReconnectPolicy, Reconnector};
use crate::reply::{extract_id, Reply};
use crate::transport::{connect_chrome_websocket, Transport};

const POLL_SLICE: Duration = Duration::from_millis(50);
const PUMP_SLICE: Duration = Duration::from_millis(100);

/// Monotonic command id source shared by everything talking to one browser.
#[derive(Debug)]
pub struct CommandIds {
    next: AtomicU64,
}

impl Default for CommandIds {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

/// `{"id","method","params"?}`; `params` is omitted when absent or null.
pub fn build_envelope(id: u64, method: &str, params: Option<&Value>) -> String {
    let mut envelope = Map::new();
    envelope.insert("id".to_string(), Value::from(id));
    envelope.insert("method".to_string(), Value::from(method));
    if let Some(params) = params.filter(|params| !params.is_null()) {
        envelope.insert("params".to_string(), params.clone());
    }
    Value::Object(envelope).to_string()
}

pub struct Dispatcher {
    endpoint: Endpoint,
    target: String,
    cfg: TransportConfig,
    ids: Arc<CommandIds>,
    bus: Arc<ResponseBus>,
    reconnector: Reconnector,
    transport: Mutex<Option<Arc<Transport>>>,
    /// Held for the whole backoff; `transport` is only locked to swap.
    reconnecting: Mutex<()>,
    pump_active: AtomicBool,
}

impl Dispatcher {
    /// Build a dispatcher without connecting; the first command connects lazily.
    pub fn new(
        endpoint: Endpoint,
        target: impl Into<String>,
        cfg: TransportConfig,
        ids: Arc<CommandIds>,
        bus: Arc<ResponseBus>,
    ) -> Self {
        let reconnector = Reconnector::new(ReconnectPolicy::from_config(&cfg), endpoint.port);
        reconnector.mark_disconnected();
        Self {
            endpoint,
            target: target.into(),
            cfg,
            ids,
            bus,
            reconnector,
            transport: Mutex::new(None),
            reconnecting: Mutex::new(()),
            pump_active: AtomicBool::new(false),
        }
    }

    pub fn connect(
        endpoint: Endpoint,
        target: impl Into<String>,
        cfg: TransportConfig,
        ids: Arc<CommandIds>,
        bus: Arc<ResponseBus>,
    ) -> AdapterResult<Self> {
        let dispatcher = Self::new(endpoint, target, cfg, ids, bus);
        let transport = connect_chrome_websocket(
            &dispatcher.endpoint,
            &dispatcher.target,
            &dispatcher.cfg,
            &dispatcher.ids,
        )?;
        *dispatcher.transport.lock() = Some(Arc::new(transport));
        dispatcher.reconnector.mark_connected();
        Ok(dispatcher)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn target_id(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &TransportConfig {
        &self.cfg
    }

    pub fn bus(&self) -> &Arc<ResponseBus> {
        &self.bus
    }

    pub fn ids(&self) -> &Arc<CommandIds> {
        &self.ids
    }

    pub fn state(&self) -> ConnState {
        self.reconnector.state()
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .lock()
            .as_ref()
            .map(|transport| transport.is_connected())
            .unwrap_or(false)
    }

    pub fn runtime_ready(&self) -> bool {
        self.transport
            .lock()
            .as_ref()
            .map(|transport| transport.runtime_ready())
            .unwrap_or(false)
    }

    /// The live transport, reconnecting first if the socket is gone.
    pub fn transport(&self) -> AdapterResult<Arc<Transport>> {
        {
            let slot = self.transport.lock();
            if let Some(transport) = slot.as_ref() {
                if transport.is_connected() {
                    return Ok(Arc::clone(transport));
                }
            }
        }
        self.reconnect()
    }

    /// Replace a dead socket with a fresh one, backing off between attempts.
    ///
    /// Concurrent callers serialise here; whoever arrives after a successful
    /// reconnect simply receives the new transport. Status readers such as
    /// [`Dispatcher::is_connected`] never wait on the backoff.
    pub fn reconnect(&self) -> AdapterResult<Arc<Transport>> {
        let _serial = self.reconnecting.lock();
        {
            let mut slot = self.transport.lock();
            if let Some(transport) = slot.as_ref() {
                if transport.is_connected() {
                    return Ok(Arc::clone(transport));
                }
            }
            if let Some(dead) = slot.take() {
                dead.close();
            }
        }
        self.reconnector.mark_disconnected();

        let transport = Arc::new(self.reconnector.reconnect_with_backoff(|_| {
            connect_chrome_websocket(&self.endpoint, &self.target, &self.cfg, &self.ids)
        })?);
        *self.transport.lock() = Some(Arc::clone(&transport));
        Ok(transport)
    }

    /// Write one raw command, retrying the write (not the round trip).
    pub fn send_command_with_retry(&self, text: &str) -> AdapterResult<usize> {
        let retries = self.cfg.send_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=retries {
            let transport = self.transport()?;
            match transport.send_text(text) {
                Ok(written) => return Ok(written),
                Err(err) => {
                    warn!(target: "cdp-dispatch", attempt, retries, %err, "send failed");
                    transport.close();
                    self.reconnector.mark_disconnected();
                    last_error = Some(err);
                    if attempt < retries {
                        thread::sleep(Duration::from_millis(100 * attempt as u64));
                    }
                }
            }
        }

        let mut err = AdapterError::new(AdapterErrorKind::SendFailed)
            .with_hint(format!("send failed after {retries} attempts"))
            .retriable(true);
        if let Some(last) = last_error {
            err = err.with_data(serde_json::json!({ "last_error": last.to_string() }));
        }
        Err(err)
    }

    /// Fire and forget. Returns the id the reply will carry.
    pub fn send_cmd(&self, method: &str, params: Option<Value>) -> AdapterResult<u64> {
        let id = self.ids.next();
        let text = build_envelope(id, method, params.as_ref());
        metrics::record_command(method);
        if let Err(err) = self.send_command_with_retry(&text) {
            metrics::record_command_failure(method);
            return Err(err);
        }
        debug!(target: "cdp-dispatch", id, method, "command sent");
        Ok(id)
    }

    /// Send and block for the correlated reply.
    ///
    /// A reply carrying `error` or `exceptionDetails` is still `Ok`: the
    /// browser answered, and the caller decides what the payload means. Only
    /// transport and correlation failures are `Err`. `timeout_ms <= 0` uses
    /// the configured default.
    pub fn call_cmd(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: i64,
    ) -> AdapterResult<Reply> {
        let timeout = self.cfg.resolve_timeout(timeout_ms);
        let started = Instant::now();
        let id = self.send_cmd(method, params)?;

        let text = match self.wait_for_reply(id, started + timeout) {
            Ok(text) => text,
            Err(err) => {
                metrics::record_command_failure(method);
                return Err(err);
            }
        };
        let reply = Reply::parse(&text)?;
        if reply.is_domain_error() {
            metrics::record_command_failure(method);
        } else {
            metrics::record_command_success(method, started.elapsed());
        }
        Ok(reply)
    }

    /// `call_cmd` with domain errors folded into `Err`; yields the `result` object.
    pub fn call(&self, method: &str, params: Option<Value>, timeout_ms: i64) -> AdapterResult<Value> {
        self.call_cmd(method, params, timeout_ms)?.into_result()
    }

    /// Read up to `max_messages` frames looking for `id`.
    ///
    /// Replies for other ids go to the bus; id-less events are dropped.
    /// `Ok(None)` means the budget ran out without a match.
    pub fn receive_response_by_id(
        &self,
        id: u64,
        max_messages: usize,
        timeout: Duration,
    ) -> AdapterResult<Option<String>> {
        let transport = self.transport()?;
        for checked in 1..=max_messages.max(1) {
            let text = match transport.recv_text(timeout) {
                Ok(text) => text,
                Err(err) => {
                    if !transport.is_connected() {
                        self.reconnector.mark_disconnected();
                    }
                    return Err(err);
                }
            };
            match extract_id(&text) {
                Some(found) if found == id => return Ok(Some(text)),
                Some(other) => {
                    trace!(target: "cdp-dispatch", wanted = id, other, checked, "parked reply");
                    self.bus.store(&text);
                }
                None => {
                    metrics::record_event();
                    trace!(target: "cdp-dispatch", wanted = id, checked, "skipped event");
                }
            }
        }
        debug!(target: "cdp-dispatch", id, max_messages, "reply not among checked messages");
        Ok(None)
    }

    /// Read at most one message into the bus. Returns how many were read.
    pub fn pump_once(&self, timeout: Duration) -> AdapterResult<usize> {
        let transport = self.transport()?;
        match transport.recv_text(timeout) {
            Ok(text) => {
                if self.bus.store(&text) == StoreOutcome::Ignored {
                    metrics::record_event();
                }
                Ok(1)
            }
            Err(err)
                if matches!(
                    err.kind,
                    AdapterErrorKind::ReplyTimeout | AdapterErrorKind::PayloadTooLarge
                ) =>
            {
                Ok(0)
            }
            Err(err) => {
                if !transport.is_connected() {
                    self.reconnector.mark_disconnected();
                }
                Err(err)
            }
        }
    }

    /// Start a background reader that feeds the bus until stopped.
    pub fn spawn_pump(self: &Arc<Self>) -> AdapterResult<PumpHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let dispatcher = Arc::clone(self);
        self.pump_active.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name("cdp-pump".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    match dispatcher.pump_once(PUMP_SLICE) {
                        Ok(_) => {}
                        Err(err) if err.kind == AdapterErrorKind::ReconnectExhausted => {
                            error!(target: "cdp-dispatch", %err, "pump stopping");
                            break;
                        }
                        Err(err) => {
                            warn!(target: "cdp-dispatch", %err, "pump read failed");
                        }
                    }
                }
                dispatcher.pump_active.store(false, Ordering::Release);
            });

        match spawned {
            Ok(join) => Ok(PumpHandle {
                stop,
                join: Some(join),
            }),
            Err(err) => {
                self.pump_active.store(false, Ordering::Release);
                Err(AdapterError::io(AdapterErrorKind::Internal, &err))
            }
        }
    }

    pub fn pump_running(&self) -> bool {
        self.pump_active.load(Ordering::Acquire)
    }

    /// Send with the reply routed to a one-shot slot.
    ///
    /// The bus callback is registered before the frame is written, so the
    /// reply cannot arrive ahead of its consumer.
    pub fn send_async(&self, method: &str, params: Option<Value>) -> AdapterResult<PendingReply> {
        let id = self.ids.next();
        let slot = Arc::new(ReplySlot::default());
        let sink = Arc::clone(&slot);
        if !self
            .bus
            .register_callback(id, Box::new(move |json| sink.fill(json)))
        {
            return Err(AdapterError::new(AdapterErrorKind::QueueFull)
                .with_hint("response bus callback table is full")
                .retriable(true));
        }

        metrics::record_command(method);
        let text = build_envelope(id, method, params.as_ref());
        if let Err(err) = self.send_command_with_retry(&text) {
            self.bus.unregister(id);
            metrics::record_command_failure(method);
            return Err(err);
        }
        Ok(PendingReply {
            id,
            method: method.to_string(),
            sent_at: Instant::now(),
            slot,
        })
    }

    /// Block for a pending reply, reading the socket ourselves when no pump runs.
    pub fn await_reply(&self, pending: &PendingReply, timeout: Duration) -> AdapterResult<Reply> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(text) = pending.slot.get() {
                return self.finish_pending(pending, &text);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if !self.bus.unregister(pending.id) {
                    // the callback fired between the check and the unregister
                    if let Some(text) = pending.slot.get() {
                        return self.finish_pending(pending, &text);
                    }
                }
                metrics::record_command_failure(&pending.method);
                return Err(reply_timeout(pending.id, timeout));
            }

            let slice = remaining.min(POLL_SLICE);
            if self.pump_running() {
                pending.slot.wait(slice);
            } else if let Err(err) = self.pump_once(slice) {
                self.bus.unregister(pending.id);
                metrics::record_command_failure(&pending.method);
                return Err(err);
            }
        }
    }

    /// Wait for every pending reply against one shared deadline.
    pub fn await_all(
        &self,
        pending: &[PendingReply],
        timeout: Duration,
    ) -> Vec<AdapterResult<Reply>> {
        let deadline = Instant::now() + timeout;
        pending
            .iter()
            .map(|item| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.await_reply(item, remaining)
            })
            .collect()
    }

    pub fn batch_send(&self, commands: &[(&str, Option<Value>)]) -> AdapterResult<Vec<PendingReply>> {
        commands
            .iter()
            .map(|(method, params)| self.send_async(method, params.clone()))
            .collect()
    }

    pub fn close(&self) {
        if let Some(transport) = self.transport.lock().take() {
            transport.close();
        }
        self.reconnector.mark_disconnected();
    }

    fn wait_for_reply(&self, id: u64, deadline: Instant) -> AdapterResult<String> {
        let started = Instant::now();
        loop {
            if let Some(text) = self.bus.try_get(id) {
                return Ok(text);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(reply_timeout(id, started.elapsed()));
            }

            let slice = remaining.min(POLL_SLICE);
            if self.pump_running() {
                if let Some(text) = self.bus.wait_take(id, slice) {
                    return Ok(text);
                }
                continue;
            }

            match self.receive_response_by_id(id, self.cfg.receive_budget, slice) {
                Ok(Some(text)) => return Ok(text),
                Ok(None) => {}
                Err(err)
                    if matches!(
                        err.kind,
                        AdapterErrorKind::ReplyTimeout | AdapterErrorKind::PayloadTooLarge
                    ) => {}
                // the command may already have run; never resend it
                Err(err) => return Err(err),
            }
        }
    }

    fn finish_pending(&self, pending: &PendingReply, text: &str) -> AdapterResult<Reply> {
        let reply = Reply::parse(text)?;
        if reply.is_domain_error() {
            metrics::record_command_failure(&pending.method);
        } else {
            metrics::record_command_success(&pending.method, pending.sent_at.elapsed());
        }
        Ok(reply)
    }
}

fn reply_timeout(id: u64, waited: Duration) -> AdapterError {
    AdapterError::new(AdapterErrorKind::ReplyTimeout)
        .with_hint(format!(
            "no reply for command {id} within {}ms",
            waited.as_millis()
        ))
        .with_data(serde_json::json!({ "id": id }))
        .retriable(true)
}

#[derive(Default)]
struct ReplySlot {
    value: Mutex<Option<String>>,
    ready: Condvar,
}

impl ReplySlot {
    fn fill(&self, json: &str) {
        *self.value.lock() = Some(json.to_string());
        self.ready.notify_all();
    }

    fn get(&self) -> Option<String> {
        self.value.lock().clone()
    }

    fn wait(&self, timeout: Duration) -> Option<String> {
        let mut value = self.value.lock();
        if value.is_none() {
            self.ready.wait_for(&mut value, timeout);
        }
        value.clone()
    }
}

/// Handle for a command sent with [`Dispatcher::send_async`].
pub struct PendingReply {
    id: u64,
    method: String,
    sent_at: Instant,
    slot: Arc<ReplySlot>,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_complete(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Wait on the slot alone; requires a running pump to make progress.
    pub fn wait(&self, timeout: Duration) -> Option<Reply> {
        self.slot
            .wait(timeout)
            .and_then(|text| Reply::parse(&text).ok())
    }
}

/// Stops and joins the pump thread when dropped.
pub struct PumpHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PumpHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
