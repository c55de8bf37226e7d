use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use cdp_adapter::testing::FakeChrome;
use cdpctl::server::{build_router, ServeState};
use cdpctl::{AppConfig, AppContext};
use serde_json::{json, Value};
use tower::ServiceExt;

fn context(chrome_port: u16) -> Arc<AppContext> {
    let mut config = AppConfig::default();
    config.chrome.port = chrome_port;
    config.chrome.auto_launch = false;
    config.transport.max_reconnect_attempts = 1;
    config.transport.reconnect_base_delay_ms = 10;
    Arc::new(AppContext::new(config))
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_and_stats_report_configuration() {
    let chrome = FakeChrome::start();
    let router = build_router(ServeState::new(context(chrome.port())));

    let (status, body) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["chrome_port"], chrome.port());

    let (status, body) = send(&router, Method::GET, "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["registry"]["total"], 0);
    assert!(body["scheduler"].is_null());
}

#[tokio::test(flavor = "current_thread")]
async fn browser_work_stays_off_the_runtime_thread() {
    let chrome = FakeChrome::start();
    let router = build_router(ServeState::new(context(chrome.port())));

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/cdp",
        Some(json!({"method": "Browser.getVersion"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["method"], "Browser.getVersion");

    let (status, body) = send(&router, Method::GET, "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cdp_calls_map_outcomes_to_statuses() {
    let chrome = FakeChrome::start();
    let router = build_router(ServeState::new(context(chrome.port())));

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/cdp",
        Some(json!({"method": "Page.navigate", "params": {"url": "about:blank"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["method"], "Page.navigate");

    // the browser answered, so a CDP error is not an HTTP error
    let (status, body) = send(&router, Method::POST, "/api/cdp", Some(json!({"method": "Test.error"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["message"], "boom");

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/cdp",
        Some(json!({"method": "Test.silent", "timeout_ms": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["kind"], "ReplyTimeout");

    let (status, _) = send(&router, Method::POST, "/api/cdp", Some(json!({"method": " "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(chrome.connections(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_browser_is_a_bad_gateway() {
    let router = build_router(ServeState::new(context(cdp_adapter::testing::closed_port())));
    let (status, body) = send(&router, Method::POST, "/api/cdp", Some(json!({"method": "Page.reload"}))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"]["message"].as_str().unwrap().contains("not running"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_instances_and_tasks_are_not_found() {
    let chrome = FakeChrome::start();
    let router = build_router(ServeState::new(context(chrome.port())));

    let (status, body) = send(&router, Method::GET, "/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = send(&router, Method::DELETE, "/instances/99", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, Method::GET, "/tasks/1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, Method::POST, "/tasks", Some(json!({"type": "stub"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn metrics_are_exposed() {
    let chrome = FakeChrome::start();
    let router = build_router(ServeState::new(context(chrome.port())));
    send(&router, Method::POST, "/api/cdp", Some(json!({"method": "Page.reload"}))).await;

    let (status, body) = send(&router, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap().contains("cdpctl_cdp_commands_total"));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instance_lifecycle_and_task_submission() {
    use cdpctl_registry::CommandSpawner;

    let temp = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.chrome.auto_launch = false;
    config.registry.base_port = 42_100;
    config.registry.temp_root = Some(temp.path().to_path_buf());
    config.registry.kill_grace = Duration::from_secs(2);
    let ctx = Arc::new(AppContext::with_spawner(
        config,
        Arc::new(CommandSpawner::new("sleep", &["30"])),
    ));
    let router = build_router(ServeState::new(Arc::clone(&ctx)));

    let (status, instance) = send(&router, Method::POST, "/instances", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(instance["status"], "running");
    let id = instance["instance_id"].as_u64().unwrap();

    let (status, list) = send(&router, Method::GET, "/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, accepted) = send(
        &router,
        Method::POST,
        "/tasks",
        Some(json!({"type": "stub", "priority": "high"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = accepted["task_id"].as_u64().unwrap();

    let mut task = Value::Null;
    for _ in 0..100 {
        let (_, body) = send(&router, Method::GET, &format!("/tasks/{task_id}"), None).await;
        task = body;
        if task["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(task["status"], "completed");
    assert_eq!(task["result"]["type"], "stub");
    assert_eq!(task["instance_id"].as_u64(), Some(id));

    let (status, body) = send(&router, Method::DELETE, &format!("/instances/{id}?force=true"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["killed"].as_u64(), Some(id));
    let (status, _) = send(&router, Method::GET, &format!("/instances/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    tokio::task::spawn_blocking(move || ctx.shutdown()).await.unwrap();
}
