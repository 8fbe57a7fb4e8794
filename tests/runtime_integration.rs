//! End-to-end tests: real listeners on fixed ports, driven over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::Request,
    routing::{get, post},
    Router,
};
use service_runtime::config::*;
use service_runtime::health::{check, CheckFailure, HealthChecks};
use service_runtime::http::RequestContextExt;
use service_runtime::lifecycle::{EventError, EventSource};
use service_runtime::{ServiceRuntime, ShutdownOutcome, ShutdownReport, TaskGroup};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

mod common;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn echo_router() -> Router {
    Router::new()
        .route(
            "/echo",
            get(|request: Request| async move { request.correlation_id().unwrap_or_default().to_string() }),
        )
        .route(
            "/panic",
            get(|| async {
                if true {
                    panic!("boom");
                }
                "unreachable"
            }),
        )
}

/// Start the runtime in the background; dropping or firing the sender stops it.
fn launch(mut options: Vec<ServerOption>) -> (oneshot::Sender<()>, TaskGroup, JoinHandle<ShutdownReport>) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let tasks = TaskGroup::new();
    options.push(with_bind_address("127.0.0.1"));
    options.push(with_shutdown_signal(
        async move {
            let _ = stop_rx.await;
        },
        tasks.clone(),
    ));
    let runtime = ServiceRuntime::from_options(options).unwrap();
    let handle = tokio::spawn(async move { runtime.run().await.unwrap() });
    (stop_tx, tasks, handle)
}

async fn finish(handle: JoinHandle<ShutdownReport>) -> ShutdownReport {
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("runtime should stop")
        .unwrap()
}

#[tokio::test]
async fn test_all_listeners_serve_and_shut_down_cleanly() {
    let health = HealthChecks::new();
    health.add_readiness_check("db", check(|| async { Err(CheckFailure::from("down")) }));

    let (stop, tasks, handle) = launch(vec![
        with_plain_listener(echo_router()),
        with_rpc_listener(|router: Router| Ok(router.route("/rpc/echo", post(|body: Bytes| async move { body })))),
        with_metrics_listener(health.router()),
        with_plain_listen_port(29111),
        with_rpc_listen_port(29112),
        with_metrics_listen_port(29113),
    ]);
    for port in [29111, 29112, 29113] {
        common::wait_for_listener(addr(port)).await;
    }
    let client = common::client();

    // correlation id is reused and echoed
    let response = client
        .get("http://127.0.0.1:29111/echo")
        .header("X-Request-Id", "abc123")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-request-id"], "abc123");
    assert_eq!(response.text().await.unwrap(), "abc123");

    // or generated when absent
    let response = client.get("http://127.0.0.1:29111/echo").send().await.unwrap();
    let generated = response.headers()["x-request-id"].to_str().unwrap().to_string();
    assert!(!generated.is_empty());
    assert_eq!(response.text().await.unwrap(), generated);

    // a panicking handler answers 500 and the listener keeps serving
    let response = client.get("http://127.0.0.1:29111/panic").send().await.unwrap();
    assert_eq!(response.status(), 500);
    response.text().await.unwrap();
    let response = client.get("http://127.0.0.1:29111/echo").send().await.unwrap();
    assert_eq!(response.status(), 200);
    response.text().await.unwrap();

    let response = client
        .post("http://127.0.0.1:29112/rpc/echo")
        .body("ping")
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "ping");

    // health lives behind the metrics listener
    let response = client.get("http://127.0.0.1:29113/healthz/live").send().await.unwrap();
    assert_eq!(response.status(), 200);
    let response = client
        .get("http://127.0.0.1:29113/healthz/ready?full=1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "db": "down" }));

    let metrics = client
        .get("http://127.0.0.1:29113/metrics")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("http_requests_processed_total{route=\"/echo\",status=\"200\"} 3"));
    assert!(metrics.contains("http_requests_processed_total{route=\"/panic\",status=\"500\"} 1"));

    let vars: serde_json::Value = client
        .get("http://127.0.0.1:29113/debug/vars")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(vars["cmdline"].is_array());

    stop.send(()).unwrap();
    let report = finish(handle).await;
    assert_eq!(report.trigger.source, EventSource::Unknown);
    assert_eq!(report.outcome, ShutdownOutcome::Clean);
    assert_eq!(report.exit_code(), 0);
    assert!(report.unresolved.is_empty());
    assert_eq!(tasks.count(), 0);
}

#[tokio::test]
async fn test_bind_failure_shuts_down_siblings() {
    let _taken = std::net::TcpListener::bind(addr(29121)).unwrap();

    let (_stop, _tasks, handle) = launch(vec![
        with_plain_listener(echo_router()),
        with_metrics_listener(HealthChecks::new().router()),
        with_plain_listen_port(29121),
        with_metrics_listen_port(29122),
    ]);

    let report = finish(handle).await;
    assert_eq!(report.trigger.source, EventSource::PlainListener);
    assert!(matches!(report.trigger.err, Some(EventError::Listener(_))));
    assert_eq!(report.outcome, ShutdownOutcome::Clean);
}

#[tokio::test]
async fn test_rate_limit_over_http() {
    let (stop, _tasks, handle) = launch(vec![
        with_plain_listener(echo_router()),
        with_plain_listen_port(29131),
        with_rate_limit(0.001, 2),
    ]);
    common::wait_for_listener(addr(29131)).await;
    let client = common::client();

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = client.get("http://127.0.0.1:29131/echo").send().await.unwrap();
        statuses.push(response.status().as_u16());
    }
    assert_eq!(statuses, vec![200, 200, 429]);

    stop.send(()).unwrap();
    assert_eq!(finish(handle).await.outcome, ShutdownOutcome::Clean);
}

#[tokio::test]
async fn test_canonical_host_redirect() {
    let (stop, _tasks, handle) = launch(vec![
        with_plain_listener(echo_router()),
        with_plain_listen_port(29141),
        with_canonical_host("www.example.com"),
    ]);
    common::wait_for_listener(addr(29141)).await;
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let response = client.get("http://127.0.0.1:29141/echo?x=1").send().await.unwrap();
    assert_eq!(response.status(), 308);
    assert_eq!(response.headers()["location"], "http://www.example.com/echo?x=1");

    stop.send(()).unwrap();
    finish(handle).await;
}

#[tokio::test]
async fn test_stuck_request_is_a_soft_timeout() {
    let entered = Arc::new(Notify::new());
    let notify = Arc::clone(&entered);
    let router = Router::new().route(
        "/slow",
        get(move || {
            let notify = Arc::clone(&notify);
            async move {
                notify.notify_one();
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }
        }),
    );

    let (stop, _tasks, handle) = launch(vec![
        with_plain_listener(router),
        with_plain_listen_port(29151),
        with_shutdown_deadline(Duration::from_secs(1)),
        with_request_timeout(Duration::from_secs(60)),
    ]);
    common::wait_for_listener(addr(29151)).await;

    let request = tokio::spawn(async {
        let _ = common::client().get("http://127.0.0.1:29151/slow").send().await;
    });
    entered.notified().await;

    stop.send(()).unwrap();
    let report = finish(handle).await;
    assert_eq!(report.outcome, ShutdownOutcome::SoftTimeout);
    assert_eq!(report.exit_code(), 1);
    request.abort();
}
