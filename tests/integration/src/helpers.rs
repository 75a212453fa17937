//! Test helpers for integration tests
//!
//! Provides a fake upstream TCP server, a bridge wrapper bound to ephemeral
//! ports, and small WebSocket client utilities.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use bridge_common::AppConfig;
use bridge_gateway::upstream::{LinkState, LinkStats};
use bridge_gateway::RunningBridge;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// Default timeout for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Listener standing in for the upstream backend
pub struct FakeUpstream {
    listener: TcpListener,
    addr: SocketAddr,
}

impl FakeUpstream {
    pub async fn bind() -> Result<Self> {
        Self::bind_port(0).await
    }

    /// Bind a specific loopback port
    pub async fn bind_port(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Accept the bridge's connection
    pub async fn accept(&self) -> Result<UpstreamPeer> {
        let (stream, _) = tokio::time::timeout(TEST_TIMEOUT, self.listener.accept())
            .await
            .context("bridge never connected to the upstream")??;
        Ok(UpstreamPeer { stream })
    }
}

/// The backend side of one upstream connection
pub struct UpstreamPeer {
    stream: TcpStream,
}

impl UpstreamPeer {
    /// Write raw bytes to the bridge
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Close the backend's write side; the bridge sees end of stream
    pub async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Read exactly `len` bytes written by the bridge
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(TEST_TIMEOUT, self.stream.read_exact(&mut buf))
            .await
            .context("timed out reading from the bridge")??;
        Ok(buf)
    }

    /// Read whatever arrives within `window`
    pub async fn read_for(&mut self, window: Duration) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + window;

        loop {
            match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Err(_) | Ok(Ok(0)) => return Ok(out),
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// A bridge running on ephemeral loopback ports
pub struct TestBridge {
    bridge: RunningBridge,
    pub peer: UpstreamPeer,
    shutdown: CancellationToken,
}

impl TestBridge {
    /// Start a bridge against `upstream`, overriding config with `vars`
    pub async fn start(upstream: &FakeUpstream, vars: &[(&str, &str)]) -> Result<Self> {
        let config = test_config(upstream.port(), vars)?;
        let shutdown = CancellationToken::new();

        let starting = tokio::spawn(bridge_gateway::start(config, shutdown.clone()));
        let peer = upstream.accept().await?;
        let bridge = tokio::time::timeout(TEST_TIMEOUT, starting)
            .await
            .context("bridge did not finish starting")???;

        Ok(Self {
            bridge,
            peer,
            shutdown,
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.bridge.ws_addr())
    }

    pub fn health_url(&self) -> String {
        format!("http://{}/health", self.bridge.ws_addr())
    }

    pub fn http_url(&self, path: &str) -> Option<String> {
        self.bridge
            .http_addr()
            .map(|addr| format!("http://{addr}{path}"))
    }

    /// Open a WebSocket client and wait until the bridge has registered it
    pub async fn connect(&self) -> Result<WsClient> {
        let before = self.client_count();
        let (ws, _) = connect_async(self.ws_url()).await?;
        self.wait_for_clients(before + 1).await?;
        Ok(ws)
    }

    pub fn client_count(&self) -> usize {
        self.bridge.state().registry().len()
    }

    /// Poll until exactly `count` clients are registered
    pub async fn wait_for_clients(&self, count: usize) -> Result<()> {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        while self.client_count() != count {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("expected {count} clients, have {}", self.client_count());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    pub fn upstream_state(&self) -> LinkState {
        self.bridge.state().upstream().state()
    }

    pub fn upstream_stats(&self) -> LinkStats {
        self.bridge.state().upstream().stats()
    }

    /// Poll until the upstream link reaches `state`
    pub async fn wait_for_upstream(&self, state: LinkState) -> Result<()> {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        while self.upstream_state() != state {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("upstream stuck in {:?}, expected {state:?}", self.upstream_state());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Shut down and wait for every task
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        tokio::time::timeout(TEST_TIMEOUT, self.bridge.wait())
            .await
            .context("bridge did not stop")??;
        Ok(())
    }
}

/// Configuration bound to loopback with ephemeral listener ports
pub fn test_config(upstream_port: u16, vars: &[(&str, &str)]) -> Result<AppConfig> {
    let upstream_port = upstream_port.to_string();
    let mut all: Vec<(&str, &str)> = vec![
        ("UPSTREAM_HOST", "127.0.0.1"),
        ("UPSTREAM_PORT", upstream_port.as_str()),
        ("UPSTREAM_RECONNECT_INITIAL_MS", "20"),
        ("UPSTREAM_RECONNECT_MAX_MS", "100"),
        ("WS_HOST", "127.0.0.1"),
        ("WS_PORT", "0"),
        ("HTTP_HOST", "127.0.0.1"),
        ("HTTP_PORT", "0"),
    ];
    all.extend_from_slice(vars);

    // Later entries win
    let config = AppConfig::from_lookup(|key| {
        all.iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| (*v).to_string())
    })?;

    Ok(config)
}

/// Next text frame, skipping control frames
pub async fn next_text(ws: &mut WsClient) -> Result<String> {
    loop {
        let frame = tokio::time::timeout(TEST_TIMEOUT, ws.next())
            .await
            .context("timed out waiting for a text frame")?
            .context("connection closed")??;

        match frame {
            Message::Text(text) => return Ok(text),
            Message::Close(_) => anyhow::bail!("connection closed"),
            _ => {}
        }
    }
}

/// Assert no text frame arrives within `window`
pub async fn expect_silence(ws: &mut WsClient, window: Duration) -> Result<()> {
    match tokio::time::timeout(window, next_text(ws)).await {
        Err(_) => Ok(()),
        Ok(Ok(text)) => anyhow::bail!("unexpected message: {text}"),
        Ok(Err(_)) => Ok(()),
    }
}

pub async fn send_text(ws: &mut WsClient, text: &str) -> Result<()> {
    ws.send(Message::Text(text.to_string())).await?;
    Ok(())
}

/// Keep reading in the background so pings are answered
pub fn keep_reading(mut ws: WsClient) -> JoinHandle<()> {
    tokio::spawn(async move { while let Some(Ok(_)) = ws.next().await {} })
}
