//! Bridge Integration Tests
//!
//! Each test runs a real bridge on loopback against a fake upstream.
//!
//! Run with: cargo test -p integration-tests --test bridge_tests

use std::time::Duration;

use bridge_gateway::upstream::LinkState;
use futures_util::SinkExt;
use integration_tests::{
    expect_silence, keep_reading, next_text, send_text, test_config, FakeUpstream, TestBridge,
};
use reqwest::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Upstream -> clients
// ============================================================================

#[tokio::test]
async fn test_upstream_line_reaches_every_client() {
    let upstream = FakeUpstream::bind().await.unwrap();
    let mut bridge = TestBridge::start(&upstream, &[]).await.unwrap();

    let mut a = bridge.connect().await.unwrap();
    let mut b = bridge.connect().await.unwrap();
    let mut c = bridge.connect().await.unwrap();

    bridge.peer.send(b"hello\n").await.unwrap();

    assert_eq!(next_text(&mut a).await.unwrap(), "hello");
    assert_eq!(next_text(&mut b).await.unwrap(), "hello");
    assert_eq!(next_text(&mut c).await.unwrap(), "hello");

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_split_and_batched_lines() {
    let upstream = FakeUpstream::bind().await.unwrap();
    let mut bridge = TestBridge::start(&upstream, &[]).await.unwrap();
    let mut ws = bridge.connect().await.unwrap();

    bridge.peer.send(b"par").await.unwrap();
    bridge.peer.send(b"tial\r\nsecond\n\nthird\n").await.unwrap();

    assert_eq!(next_text(&mut ws).await.unwrap(), "partial");
    assert_eq!(next_text(&mut ws).await.unwrap(), "second");
    assert_eq!(next_text(&mut ws).await.unwrap(), "third");

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_closed_client_not_delivered_to() {
    let upstream = FakeUpstream::bind().await.unwrap();
    let mut bridge = TestBridge::start(&upstream, &[]).await.unwrap();

    let mut stays = bridge.connect().await.unwrap();
    let mut leaves = bridge.connect().await.unwrap();

    leaves.close(None).await.unwrap();
    bridge.wait_for_clients(1).await.unwrap();

    bridge.peer.send(b"after close\n").await.unwrap();
    assert_eq!(next_text(&mut stays).await.unwrap(), "after close");

    bridge.stop().await.unwrap();
}

// ============================================================================
// Clients -> upstream
// ============================================================================

#[tokio::test]
async fn test_client_message_reaches_upstream_verbatim() {
    let upstream = FakeUpstream::bind().await.unwrap();
    let mut bridge = TestBridge::start(&upstream, &[]).await.unwrap();
    let mut ws = bridge.connect().await.unwrap();

    let query = r#"{"query":"GET","param":{"i":[]}}"#;
    send_text(&mut ws, query).await.unwrap();

    let received = bridge.peer.read_exact(query.len()).await.unwrap();
    assert_eq!(received, query.as_bytes());

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_binary_message_forwarded_as_bytes() {
    let upstream = FakeUpstream::bind().await.unwrap();
    let mut bridge = TestBridge::start(&upstream, &[]).await.unwrap();
    let mut ws = bridge.connect().await.unwrap();

    ws.send(Message::Binary(vec![0x00, 0xff, 0x10])).await.unwrap();

    assert_eq!(bridge.peer.read_exact(3).await.unwrap(), vec![0x00, 0xff, 0x10]);

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_append_newline_option() {
    let upstream = FakeUpstream::bind().await.unwrap();
    let mut bridge = TestBridge::start(&upstream, &[("UPSTREAM_APPEND_NEWLINE", "true")])
        .await
        .unwrap();
    let mut ws = bridge.connect().await.unwrap();

    send_text(&mut ws, "ping").await.unwrap();
    send_text(&mut ws, "pong").await.unwrap();

    assert_eq!(bridge.peer.read_exact(10).await.unwrap(), b"ping\npong\n");

    bridge.stop().await.unwrap();
}

// ============================================================================
// Upstream loss
// ============================================================================

#[tokio::test]
async fn test_messages_dropped_after_upstream_close() {
    let upstream = FakeUpstream::bind().await.unwrap();
    let mut bridge = TestBridge::start(&upstream, &[("UPSTREAM_RECONNECT", "false")])
        .await
        .unwrap();
    let mut ws = bridge.connect().await.unwrap();

    bridge.peer.close().await.unwrap();
    bridge.wait_for_upstream(LinkState::Disconnected).await.unwrap();

    send_text(&mut ws, "into the void").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The client keeps its session; the message is simply gone
    assert_eq!(bridge.client_count(), 1);
    assert_eq!(bridge.upstream_stats().dropped, 1);
    assert!(bridge
        .peer
        .read_for(Duration::from_millis(200))
        .await
        .unwrap()
        .is_empty());

    send_text(&mut ws, "still open").await.unwrap();
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnects_and_resumes_broadcast() {
    let upstream = FakeUpstream::bind().await.unwrap();
    let mut bridge = TestBridge::start(&upstream, &[]).await.unwrap();
    let mut ws = bridge.connect().await.unwrap();

    bridge.peer.close().await.unwrap();
    bridge.peer = upstream.accept().await.unwrap();
    bridge.wait_for_upstream(LinkState::Connected).await.unwrap();

    bridge.peer.send(b"back again\n").await.unwrap();
    assert_eq!(next_text(&mut ws).await.unwrap(), "back again");

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_queue_policy_flushes_after_reconnect() {
    let upstream = FakeUpstream::bind().await.unwrap();
    let mut bridge = TestBridge::start(
        &upstream,
        &[
            ("UPSTREAM_OFFLINE_POLICY", "queue"),
            ("UPSTREAM_RECONNECT_INITIAL_MS", "500"),
        ],
    )
    .await
    .unwrap();
    let mut ws = bridge.connect().await.unwrap();

    bridge.peer.close().await.unwrap();
    bridge.wait_for_upstream(LinkState::Disconnected).await.unwrap();

    send_text(&mut ws, "held|").await.unwrap();
    send_text(&mut ws, "also held|").await.unwrap();

    bridge.peer = upstream.accept().await.unwrap();
    assert_eq!(bridge.peer.read_exact(15).await.unwrap(), b"held|also held|");

    bridge.stop().await.unwrap();
}

// ============================================================================
// Startup gating
// ============================================================================

#[tokio::test]
async fn test_listeners_wait_for_upstream() {
    let probe = FakeUpstream::bind().await.unwrap();
    let port = probe.port();
    drop(probe);

    let config = test_config(port, &[("UPSTREAM_RECONNECT_INITIAL_MS", "20")]).unwrap();
    let shutdown = CancellationToken::new();
    let starting = tokio::spawn(bridge_gateway::start(config, shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!starting.is_finished());

    let upstream = FakeUpstream::bind_port(port).await.unwrap();
    let _peer = upstream.accept().await.unwrap();

    let bridge = starting.await.unwrap().unwrap();
    assert_eq!(bridge.state().upstream().state(), LinkState::Connected);

    shutdown.cancel();
    bridge.wait().await.unwrap();
}

#[tokio::test]
async fn test_startup_fails_without_upstream() {
    let probe = FakeUpstream::bind().await.unwrap();
    let port = probe.port();
    drop(probe);

    let config = test_config(port, &[("UPSTREAM_RECONNECT", "false")]).unwrap();
    let result = bridge_gateway::start(config, CancellationToken::new()).await;

    let err = result.unwrap_err();
    assert_eq!(err.error_code(), "UPSTREAM_UNAVAILABLE");
}

// ============================================================================
// Liveness
// ============================================================================

#[tokio::test]
async fn test_silent_client_is_evicted() {
    let upstream = FakeUpstream::bind().await.unwrap();
    let bridge = TestBridge::start(&upstream, &[("PING_INTERVAL_SECS", "1")])
        .await
        .unwrap();

    let reader = keep_reading(bridge.connect().await.unwrap());
    let mut silent = bridge.connect().await.unwrap();

    // Pinged at the first tick, evicted at the second
    bridge.wait_for_clients(1).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(bridge.client_count(), 1);
    assert!(!reader.is_finished());

    assert!(next_text(&mut silent).await.is_err());

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_stalled_upstream_does_not_evict_responsive_clients() {
    let upstream = FakeUpstream::bind().await.unwrap();
    // The peer is held but never read from
    let bridge = TestBridge::start(&upstream, &[("PING_INTERVAL_SECS", "1")])
        .await
        .unwrap();

    let mut flooder = bridge.connect().await.unwrap();
    let mut quiet = bridge.connect().await.unwrap();

    let chunk = "x".repeat(1024 * 1024);
    for _ in 0..32 {
        send_text(&mut flooder, &chunk).await.unwrap();
    }
    send_text(&mut quiet, "hi").await.unwrap();

    let flooder = keep_reading(flooder);
    let quiet = keep_reading(quiet);

    // Two full sweeps with both clients answering pings
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(bridge.client_count(), 2);
    assert!(!flooder.is_finished());
    assert!(!quiet.is_finished());
    assert_eq!(bridge.upstream_state(), LinkState::Connected);

    bridge.stop().await.unwrap();
}

// ============================================================================
// HTTP surfaces
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let upstream = FakeUpstream::bind().await.unwrap();
    let bridge = TestBridge::start(&upstream, &[]).await.unwrap();
    let mut ws = bridge.connect().await.unwrap();

    let response = reqwest::get(bridge.health_url()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health: serde_json::Value = response.json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["upstream"], "connected");
    assert_eq!(health["clients"], 1);

    expect_silence(&mut ws, Duration::from_millis(50)).await.unwrap();
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_static_files() {
    let site = tempfile::tempdir().unwrap();
    std::fs::write(site.path().join("index.html"), "<h1>dashboard</h1>").unwrap();
    std::fs::write(site.path().join("style.css"), "body {}").unwrap();
    let root = site.path().to_string_lossy().into_owned();

    let upstream = FakeUpstream::bind().await.unwrap();
    let bridge = TestBridge::start(&upstream, &[("STATIC_ROOT", root.as_str())])
        .await
        .unwrap();

    let index = reqwest::get(bridge.http_url("/").unwrap()).await.unwrap();
    assert_eq!(index.status(), StatusCode::OK);
    assert_eq!(index.headers()["content-type"], "text/html");
    assert_eq!(index.text().await.unwrap(), "<h1>dashboard</h1>");

    let css = reqwest::get(bridge.http_url("/style.css").unwrap()).await.unwrap();
    assert_eq!(css.headers()["content-type"], "text/css");

    let missing = reqwest::get(bridge.http_url("/missing.js").unwrap()).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(missing.text().await.unwrap(), "404 Not Found");

    bridge.stop().await.unwrap();
}
