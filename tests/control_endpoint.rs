//! Control endpoint driven over a real TCP socket against an in-memory pipeline.

use std::sync::Arc;
use std::time::Duration;

use cdc_core::PartitionId;
use cdc_migrate::control_server::{handle_request, ControlServer};
use change_decoder::ChangeDecoder;
use dead_letter::{DeadLetterRouter, MemoryDeadLetterSink};
use pipeline::{ControlHandle, Coordinator, PipelineConfig, RetryPolicy};
use serde_json::{json, Value};
use target_sink::MemoryTarget;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use transport::MemoryTransport;

fn users() -> PartitionId {
    PartitionId::new("cdc.public.users", 0)
}

fn config() -> PipelineConfig {
    PipelineConfig {
        batch_size: 10,
        batch_wait: Duration::from_millis(20),
        poll_timeout: Duration::from_millis(10),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        data_error_attempts: 2,
        lag_poll_interval: Duration::from_millis(20),
        dwell: Duration::from_secs(60),
        shutdown_deadline: Duration::from_secs(5),
        max_pause: Duration::from_millis(100),
    }
}

fn coordinator(transport: &MemoryTransport) -> Coordinator {
    Coordinator::new(
        Arc::new(transport.clone()),
        Arc::new(MemoryTarget::new()),
        ChangeDecoder::default(),
        Arc::new(DeadLetterRouter::new(Arc::new(MemoryDeadLetterSink::new()))),
        config(),
    )
}

async fn request(addr: std::net::SocketAddr, method: &str, path: &str, body: &str) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("malformed response: {response}"));
    let (_, payload) = response
        .split_once("\r\n\r\n")
        .unwrap_or_else(|| panic!("no body in response: {response}"));
    (status, serde_json::from_str(payload).unwrap())
}

async fn serve(control: ControlHandle) -> std::net::SocketAddr {
    let server = ControlServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve(control));
    addr
}

#[tokio::test]
async fn test_routes_before_any_observation() {
    let transport = MemoryTransport::new();
    let control = coordinator(&transport).control();
    let addr = serve(control).await;

    let (status, body) = request(addr, "GET", "/health", "").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");

    let (status, body) = request(addr, "GET", "/lag", "").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!([]));

    let (status, body) = request(addr, "POST", "/cutover", "").await;
    assert_eq!(status, 409);
    assert_eq!(body["decision"], "rejected");
    assert_eq!(body["reason"], "no lag observations yet");

    let (status, body) = request(addr, "GET", "/lag/cdc.public.users%5B0%5D", "").await;
    assert_eq!(status, 404);
    assert!(body["error"].as_str().unwrap().contains("cdc.public.users[0]"));

    let (status, _) = request(addr, "GET", "/lag/not-a-partition", "").await;
    assert_eq!(status, 400);

    let (status, _) = request(addr, "POST", "/resume/cdc.public.users:0", "").await;
    assert_eq!(status, 404);

    let (status, _) = request(addr, "GET", "/cutover", "").await;
    assert_eq!(status, 405);

    let (status, _) = request(addr, "GET", "/nope", "").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_write_signals_and_force_ready() {
    let transport = MemoryTransport::new();
    let control = coordinator(&transport).control();

    let response = handle_request(&control, "POST", "/writes-paused", b"").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body["gate"], "replicating");

    let response = handle_request(&control, "POST", "/force-ready", b"not json").await;
    assert_eq!(response.status, 400);

    let body = br#"{"operator": "alice", "reason": "lag monitor stuck on empty topic"}"#;
    let response = handle_request(&control, "POST", "/force-ready", body).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body["gate"], "ready_for_cutover");

    let response = handle_request(&control, "POST", "/cutover", b"").await;
    assert_eq!(response.status, 200, "{}", response.body);
    assert_eq!(response.body["decision"], "accepted");

    // Cannot force the gate back once cutover has started
    let response = handle_request(&control, "POST", "/force-ready", body).await;
    assert_eq!(response.status, 409);

    let response = handle_request(&control, "GET", "/state", b"").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body["gate"], "cutover_in_progress");
    assert_eq!(response.body["writes_paused"], true);
    let reasons: Vec<&str> = response.body["gate_history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["reason"].as_str().unwrap())
        .collect();
    assert!(
        reasons.iter().any(|r| r.contains("operator override by alice")),
        "{reasons:?}"
    );
}

#[tokio::test]
async fn test_resume_blocked_partition_over_http() {
    let transport = MemoryTransport::new();
    transport
        .publish_json(&users(), &json!({"op": "c", "after": {"id": 1, "email": "a@x"}}))
        .await;
    transport
        .publish_json(
            &users(),
            &json!({"ddl": "ALTER TABLE users ADD COLUMN age INT", "source": {"table": "users"}}),
        )
        .await;
    transport
        .publish_json(&users(), &json!({"op": "c", "after": {"id": 2, "email": "b@x"}}))
        .await;

    let coordinator = coordinator(&transport);
    let control = coordinator.control();
    let addr = serve(control.clone()).await;
    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    let run = tokio::spawn(async move { coordinator.run(async move { signal.notified().await }).await });

    let mut blocked = false;
    for _ in 0..500 {
        let (_, state) = request(addr, "GET", "/state", "").await;
        if state["partitions"][0]["worker"]["state"] == "blocked" {
            blocked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(blocked, "partition never blocked on the schema change");

    // Lag never reaches zero while blocked on position 1
    let (status, body) = request(addr, "POST", "/cutover", "").await;
    assert_eq!(status, 409, "{body}");

    let (status, body) = request(addr, "POST", "/resume/cdc.public.users[0]", "").await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["resumed"], "cdc.public.users[0]");

    let mut caught_up = false;
    for _ in 0..500 {
        let (status, lag) = request(addr, "GET", "/lag/cdc.public.users:0", "").await;
        if status == 200 && lag["committed_position"] == 2 && lag["lag_events"] == 0 {
            caught_up = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(caught_up, "partition did not catch up after resume");

    let (status, _) = request(addr, "POST", "/resume/cdc.public.users[0]", "").await;
    assert_eq!(status, 409, "resuming a streaming partition is a conflict");

    shutdown.notify_one();
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.halted().count(), 0);
}
