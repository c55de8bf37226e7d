use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use rand::RngCore;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Endpoint, TransportConfig};
use crate::dispatch::{build_envelope, CommandIds};
use crate::error::{AdapterError, AdapterErrorKind, AdapterResult};
use crate::frame::{self, Opcode};
use crate::metrics;

const HANDSHAKE_LIMIT: usize = 8192;
const FRAME_BODY_TIMEOUT: Duration = Duration::from_secs(5);
const CONTROL_PAYLOAD_LIMIT: usize = 125;

/// A single WebSocket attachment to a browser or page target.
///
/// Reads and writes are guarded by separate locks: one reader pulls whole
/// messages while any number of senders serialise their frames on the
/// writer, so concurrent callers never interleave bytes on the wire.
pub struct Transport {
    endpoint: Endpoint,
    target: String,
    max_payload: usize,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
    connected: AtomicBool,
    runtime_ready: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Transport {
    /// Open a TCP connection and perform the HTTP/1.1 Upgrade handshake.
    pub fn connect(
        endpoint: &Endpoint,
        target: &str,
        cfg: &TransportConfig,
    ) -> AdapterResult<Self> {
        let path = devtools_path(target)?;
        let stream = open_stream(endpoint, cfg.connect_timeout())?;
        handshake(&stream, endpoint, &path, cfg.connect_timeout())?;

        let writer = stream
            .try_clone()
            .map_err(|err| AdapterError::io(AdapterErrorKind::ConnectionFailed, &err))?;
        info!(
            target: "cdp-transport",
            endpoint = %endpoint.authority(),
            %path,
            "websocket connected"
        );

        Ok(Self {
            endpoint: endpoint.clone(),
            target: target.to_string(),
            max_payload: cfg.max_payload,
            reader: Mutex::new(BufReader::new(stream)),
            writer: Mutex::new(writer),
            connected: AtomicBool::new(true),
            runtime_ready: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn target_id(&self) -> &str {
        &self.target
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_page_target(&self) -> bool {
        self.target.contains("page/")
    }

    pub fn runtime_ready(&self) -> bool {
        self.runtime_ready.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Issue `Runtime.enable` without waiting; its reply lands on the bus like any other.
    pub fn enable_runtime(&self, id: u64) -> AdapterResult<()> {
        self.send_text(&build_envelope(id, "Runtime.enable", None))?;
        self.runtime_ready.store(true, Ordering::Release);
        debug!(target: "cdp-transport", id, "Runtime.enable issued");
        Ok(())
    }

    /// Send one masked text frame. Returns the number of payload bytes written.
    pub fn send_text(&self, text: &str) -> AdapterResult<usize> {
        if !self.is_connected() {
            return Err(AdapterError::new(AdapterErrorKind::ConnectionClosed)
                .with_hint("socket already closed")
                .retriable(true));
        }
        let encoded = frame::encode_text(text);
        self.write_frame(&encoded).map_err(|err| {
            self.fail(AdapterError::io(AdapterErrorKind::SendFailed, &err).retriable(true))
        })?;
        self.touch();
        Ok(text.len())
    }

    /// Block for the next complete text message, answering pings on the way.
    ///
    /// A timeout while no frame has started is reported as `ReplyTimeout` and
    /// leaves the connection usable. Close frames and broken streams mark the
    /// transport dead.
    pub fn recv_text(&self, timeout: Duration) -> AdapterResult<String> {
        if !self.is_connected() {
            return Err(AdapterError::new(AdapterErrorKind::ConnectionClosed)
                .with_hint("socket already closed")
                .retriable(true));
        }

        let mut reader = self.reader.lock();
        let mut message: Vec<u8> = Vec::new();
        let mut deadline = Instant::now() + timeout;

        loop {
            wait_readable(&mut reader, deadline).map_err(|err| self.fail(err))?;
            if let Err(err) = reader.get_ref().set_read_timeout(Some(FRAME_BODY_TIMEOUT)) {
                return Err(self.fail(AdapterError::io(
                    AdapterErrorKind::ConnectionClosed,
                    &err,
                )));
            }

            let header = frame::read_header(&mut *reader).map_err(|err| self.fail(err))?;
            match header.opcode {
                Opcode::Ping => {
                    let payload = frame::read_payload(&mut *reader, &header, CONTROL_PAYLOAD_LIMIT)
                        .map_err(|err| self.fail(err))?;
                    self.write_frame(&frame::encode_pong(&payload)).map_err(|err| {
                        self.fail(AdapterError::io(AdapterErrorKind::SendFailed, &err))
                    })?;
                    debug!(target: "cdp-frame", "answered ping");
                }
                Opcode::Pong => {
                    frame::read_payload(&mut *reader, &header, CONTROL_PAYLOAD_LIMIT)
                        .map_err(|err| self.fail(err))?;
                }
                Opcode::Close => {
                    let _ = frame::read_payload(&mut *reader, &header, CONTROL_PAYLOAD_LIMIT);
                    return Err(self.fail(
                        AdapterError::new(AdapterErrorKind::ConnectionClosed)
                            .with_hint("peer sent close frame")
                            .retriable(true),
                    ));
                }
                Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                    if header.opcode == Opcode::Continuation && message.is_empty() {
                        // tail of a message abandoned by an earlier timeout
                        frame::skip_payload(&mut *reader, &header).map_err(|err| self.fail(err))?;
                        continue;
                    }
                    let budget = self.max_payload.saturating_sub(message.len());
                    let payload = match frame::read_payload(&mut *reader, &header, budget) {
                        Ok(payload) => payload,
                        Err(err) if err.kind == AdapterErrorKind::PayloadTooLarge => {
                            frame::skip_payload(&mut *reader, &header)
                                .map_err(|skip| self.fail(skip))?;
                            warn!(
                                target: "cdp-frame",
                                len = header.len,
                                max = self.max_payload,
                                "dropped oversized message"
                            );
                            return Err(err);
                        }
                        Err(err) => return Err(self.fail(err)),
                    };
                    message.extend_from_slice(&payload);
                    if header.fin {
                        self.touch();
                        return String::from_utf8(message).map_err(|err| {
                            AdapterError::new(AdapterErrorKind::ProtocolViolation)
                                .with_hint(format!("non utf-8 message: {err}"))
                        });
                    }
                    deadline = Instant::now() + FRAME_BODY_TIMEOUT;
                }
                Opcode::Reserved(raw) => {
                    return Err(self.fail(
                        AdapterError::new(AdapterErrorKind::ProtocolViolation)
                            .with_hint(format!("reserved opcode {raw:#x}")),
                    ));
                }
            }
        }
    }

    /// Send a close frame (best effort) and shut the socket down.
    pub fn close(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock();
        let _ = writer.write_all(&frame::encode_close());
        let _ = writer.shutdown(Shutdown::Both);
        info!(target: "cdp-transport", target_id = %self.target, "websocket closed");
    }

    fn write_frame(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(bytes)?;
        writer.flush()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn fail(&self, err: AdapterError) -> AdapterError {
        if err.is_connection_dead() && self.connected.swap(false, Ordering::AcqRel) {
            warn!(target: "cdp-transport", target_id = %self.target, %err, "connection lost");
            if let Some(writer) = self.writer.try_lock() {
                let _ = writer.shutdown(Shutdown::Both);
            }
        }
        err
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.writer.get_mut().shutdown(Shutdown::Both);
        }
    }
}

/// Connect to `target_id` and, for page targets, re-establish the Runtime domain.
pub fn connect_chrome_websocket(
    endpoint: &Endpoint,
    target_id: &str,
    cfg: &TransportConfig,
    ids: &CommandIds,
) -> AdapterResult<Transport> {
    let transport = Transport::connect(endpoint, target_id, cfg)?;
    metrics::record_connect();
    if transport.is_page_target() {
        transport.enable_runtime(ids.next())?;
    }
    Ok(transport)
}

/// Map a target id, absolute path, or full ws:// URL to the request path.
pub fn devtools_path(target: &str) -> AdapterResult<String> {
    if target.starts_with("ws://") || target.starts_with("wss://") {
        let url = Url::parse(target).map_err(|err| {
            AdapterError::new(AdapterErrorKind::ConnectionFailed)
                .with_hint(format!("invalid websocket url {target}: {err}"))
        })?;
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        return Ok(path);
    }
    if target.starts_with('/') {
        return Ok(target.to_string());
    }
    Ok(format!("/devtools/{target}"))
}

fn open_stream(endpoint: &Endpoint, timeout: Duration) -> AdapterResult<TcpStream> {
    let addrs = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|err| {
            AdapterError::io(AdapterErrorKind::ConnectionFailed, &err).retriable(true)
        })?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    let hint = match last_err {
        Some(err) => format!("connect to {} failed: {err}", endpoint.authority()),
        None => format!("no address resolved for {}", endpoint.authority()),
    };
    Err(AdapterError::new(AdapterErrorKind::ConnectionFailed)
        .with_hint(hint)
        .retriable(true))
}

fn handshake(
    stream: &TcpStream,
    endpoint: &Endpoint,
    path: &str,
    timeout: Duration,
) -> AdapterResult<()> {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    let key = STANDARD.encode(key);

    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        host = endpoint.authority(),
    );

    let io_err = |err: io::Error| AdapterError::io(AdapterErrorKind::ConnectionFailed, &err);
    let mut stream_ref = stream;
    stream_ref.set_write_timeout(Some(timeout)).map_err(io_err)?;
    stream_ref.set_read_timeout(Some(timeout)).map_err(io_err)?;
    stream_ref.write_all(request.as_bytes()).map_err(io_err)?;

    // byte at a time so no frame data is consumed past the header block
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= HANDSHAKE_LIMIT {
            return Err(AdapterError::new(AdapterErrorKind::HandshakeRejected)
                .with_hint("handshake response exceeds 8192 bytes"));
        }
        match stream_ref.read(&mut byte) {
            Ok(0) => {
                return Err(AdapterError::new(AdapterErrorKind::HandshakeRejected)
                    .with_hint("connection closed during handshake"))
            }
            Ok(_) => response.push(byte[0]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(io_err(err)),
        }
    }

    let text = String::from_utf8_lossy(&response);
    let status_line = text.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1);
    if status != Some("101") {
        return Err(AdapterError::new(AdapterErrorKind::HandshakeRejected)
            .with_hint(format!("unexpected handshake status: {status_line}")));
    }
    Ok(())
}

fn wait_readable(reader: &mut BufReader<TcpStream>, deadline: Instant) -> AdapterResult<()> {
    if !reader.buffer().is_empty() {
        return Ok(());
    }
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timeout_error());
        }
        reader
            .get_ref()
            .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
            .map_err(|err| AdapterError::io(AdapterErrorKind::ConnectionClosed, &err))?;
        match reader.fill_buf() {
            Ok([]) => {
                return Err(AdapterError::new(AdapterErrorKind::ConnectionClosed)
                    .with_hint("peer closed the socket")
                    .retriable(true))
            }
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(timeout_error())
            }
            Err(err) => {
                return Err(AdapterError::io(AdapterErrorKind::ConnectionClosed, &err).retriable(true))
            }
        }
    }
}

fn timeout_error() -> AdapterError {
    AdapterError::new(AdapterErrorKind::ReplyTimeout)
        .with_hint("no frame arrived before the deadline")
        .retriable(true)
}
