//! Loopback DevTools endpoint for tests.
//!
//! Speaks just enough of the protocol to exercise the client: the HTTP
//! upgrade, `/json/version`, unmasked server frames and a few scripted
//! `Test.*` methods that misbehave on purpose.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::Endpoint;
use crate::frame::{self, Opcode};

#[derive(Default)]
struct Shared {
    methods: Mutex<Vec<String>>,
    pongs: AtomicUsize,
    connections: AtomicUsize,
    targets: AtomicUsize,
    browser_closed: AtomicBool,
    stop: AtomicBool,
}

pub struct FakeChrome {
    port: u16,
    shared: Arc<Shared>,
}

impl FakeChrome {
    pub fn start() -> Self {
        Self::spawn(false)
    }

    /// Answers every upgrade with `403 Forbidden`.
    pub fn rejecting() -> Self {
        Self::spawn(true)
    }

    fn spawn(reject: bool) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind fake chrome");
        let port = listener.local_addr().expect("local addr").port();
        let shared = Arc::new(Shared::default());
        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_shared.stop.load(Ordering::Acquire) {
                    break;
                }
                let Ok(stream) = stream else { continue };
                let conn_shared = Arc::clone(&accept_shared);
                thread::spawn(move || serve_connection(stream, port, reject, conn_shared));
            }
        });
        Self { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port)
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.shared.methods.lock().clone()
    }

    pub fn count_of(&self, method: &str) -> usize {
        self.shared
            .methods
            .lock()
            .iter()
            .filter(|seen| seen.as_str() == method)
            .count()
    }

    pub fn pongs(&self) -> usize {
        self.shared.pongs.load(Ordering::Acquire)
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }

    pub fn browser_closed(&self) -> bool {
        self.shared.browser_closed.load(Ordering::Acquire)
    }
}

impl Drop for FakeChrome {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        // unblock the accept loop
        let _ = TcpStream::connect(("127.0.0.1", self.port));
    }
}

/// A port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind free port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

fn serve_connection(mut stream: TcpStream, port: u16, reject: bool, shared: Arc<Shared>) {
    let Some(request) = read_request_head(&mut stream) else {
        return;
    };
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    if path.starts_with("/json/version") {
        let body = json!({
            "Browser": "FakeChrome/1.0",
            "Protocol-Version": "1.3",
            "webSocketDebuggerUrl": format!("ws://127.0.0.1:{port}/devtools/browser/fake-browser-id"),
        })
        .to_string();
        let _ = write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        return;
    }

    if path.starts_with("/json/list") {
        let body = json!([{
            "id": "FAKE-PAGE",
            "type": "page",
            "title": "about:blank",
            "url": "about:blank",
            "webSocketDebuggerUrl": format!("ws://127.0.0.1:{port}/devtools/page/FAKE-PAGE"),
        }])
        .to_string();
        let _ = write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        return;
    }

    if reject {
        let _ = stream.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n");
        return;
    }

    let _ = stream.write_all(
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
    );
    shared.connections.fetch_add(1, Ordering::AcqRel);

    let Ok(write_half) = stream.try_clone() else {
        return;
    };
    let writer = Arc::new(Mutex::new(write_half));

    loop {
        let Ok(incoming) = frame::decode_frame(&mut stream, 1 << 24) else {
            return;
        };
        match incoming.opcode {
            Opcode::Pong => {
                shared.pongs.fetch_add(1, Ordering::AcqRel);
            }
            Opcode::Close => return,
            Opcode::Text => {
                let Ok(message) = serde_json::from_slice::<Value>(&incoming.payload) else {
                    continue;
                };
                if !handle_command(&message, &writer, &shared) {
                    return;
                }
            }
            _ => {}
        }
    }
}

/// Returns false once the connection should end.
fn handle_command(message: &Value, writer: &Arc<Mutex<TcpStream>>, shared: &Shared) -> bool {
    let id = message.get("id").cloned().unwrap_or(Value::Null);
    let method = message
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = message.get("params").cloned().unwrap_or(Value::Null);
    shared.methods.lock().push(method.clone());

    match method.as_str() {
        "Test.silent" => {}
        "Test.error" => send(
            writer,
            &json!({"id": id, "error": {"code": -32000, "message": "boom"}}),
        ),
        "Test.exception" => send(
            writer,
            &json!({"id": id, "result": {
                "result": {"type": "object", "subtype": "error"},
                "exceptionDetails": {
                    "text": "Uncaught",
                    "exception": {"description": "ReferenceError: x is not defined"}
                }
            }}),
        ),
        "Test.pingThenReply" => {
            send_raw(writer, &frame::encode_frame(Opcode::Ping, b"hb", None));
            send(writer, &json!({"id": id, "result": {"method": method}}));
        }
        "Test.event" => {
            send(writer, &json!({"method": "Page.loadEventFired", "params": {}}));
            send(writer, &json!({"id": id, "result": {"method": method}}));
        }
        "Test.large" => {
            let size = params.get("size").and_then(Value::as_u64).unwrap_or(1024) as usize;
            send(
                writer,
                &json!({"id": id, "result": {"data": "a".repeat(size)}}),
            );
        }
        "Test.delay" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(100);
            let writer = Arc::clone(writer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(ms));
                send(&writer, &json!({"id": id, "result": {"method": "Test.delay", "ms": ms}}));
            });
        }
        "Test.close" => {
            send_raw(writer, &frame::encode_frame(Opcode::Close, &[0x03, 0xE8], None));
            return false;
        }
        "Test.drop" => {
            let _ = writer.lock().shutdown(Shutdown::Both);
            return false;
        }
        "Target.createTarget" => {
            let n = shared.targets.fetch_add(1, Ordering::AcqRel) + 1;
            send(
                writer,
                &json!({"id": id, "result": {"targetId": format!("FAKE-TARGET-{n}")}}),
            );
        }
        "Browser.close" => {
            shared.browser_closed.store(true, Ordering::Release);
            send(writer, &json!({"id": id, "result": {}}));
            let _ = writer.lock().shutdown(Shutdown::Both);
            return false;
        }
        _ => send(writer, &json!({"id": id, "result": {"method": method}})),
    }
    true
}

fn send(writer: &Arc<Mutex<TcpStream>>, value: &Value) {
    let text = value.to_string();
    send_raw(writer, &frame::encode_frame(Opcode::Text, text.as_bytes(), None));
}

fn send_raw(writer: &Arc<Mutex<TcpStream>>, bytes: &[u8]) {
    let mut guard = writer.lock();
    let _ = guard.write_all(bytes);
    let _ = guard.flush();
}

fn read_request_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => return None,
            Ok(_) => head.push(byte[0]),
        }
        if head.len() > 16 * 1024 {
            return None;
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}
