//! Upstream TCP link
//!
//! Owns the single outbound TCP connection. Inbound lines are forwarded to the
//! broadcast router over a channel. Outbound payloads go through a bounded
//! channel to one writer loop per connection, so payloads from different
//! clients never interleave and no caller ever waits on the socket.

use super::backoff::Backoff;
use super::codec::LineCodec;
use bridge_common::{OfflinePolicy, UpstreamConfig};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

type UpstreamWriter = FramedWrite<OwnedWriteHalf, LineCodec>;

/// Payloads buffered for a connected writer before `send` stops accepting
pub const WRITE_BUFFER: usize = 256;

/// Connection state of the upstream link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// What happened to a payload handed to [`UpstreamLink::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the connected writer
    Sent,
    /// Held until the link reconnects
    Queued,
    /// Discarded because the link is down or backed up
    Dropped,
}

/// Upstream link errors
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Gave up after {attempts} consecutive failed attempts")]
    GaveUp { attempts: u32 },
}

/// Why a connected session ended
enum SessionEnd {
    Shutdown,
    Closed,
}

/// Counters exposed through the health endpoint
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub written: u64,
    pub queued: u64,
    pub dropped: u64,
    pub received: u64,
}

/// The single upstream TCP link shared by every client session
pub struct UpstreamLink {
    config: UpstreamConfig,
    state: watch::Sender<LinkState>,
    /// Present only while a writer loop is running
    outbox: Mutex<Option<mpsc::Sender<Bytes>>>,
    queue: Mutex<VecDeque<Bytes>>,
    written: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
}

impl UpstreamLink {
    /// Create a new link; nothing connects until [`UpstreamLink::run`]
    #[must_use]
    pub fn new(config: UpstreamConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);

        Self {
            config,
            state,
            outbox: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            written: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    /// Create a new link wrapped in Arc
    #[must_use]
    pub fn new_shared(config: UpstreamConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Get the link configuration
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Get the current state
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Check if the link is connected
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Resolve once the link reaches `Connected`
    pub async fn wait_connected(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|state| *state == LinkState::Connected).await;
    }

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            written: self.written.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }

    /// Number of payloads waiting for a connection
    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Upstream state changed");
        }
    }

    /// Hand a payload to the upstream writer without waiting
    ///
    /// While the link is down, or the writer is backed up by a backend that
    /// stopped reading, the payload is dropped or queued according to the
    /// configured offline policy. The payload is never modified.
    pub fn send(&self, payload: impl Into<Bytes>) -> SendOutcome {
        let payload = payload.into();
        let outbox = self.outbox.lock();

        let payload = match outbox.as_ref() {
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => return SendOutcome::Sent,
                Err(mpsc::error::TrySendError::Full(payload)) => {
                    tracing::warn!(buffered = WRITE_BUFFER, "Upstream not keeping up, write buffer full");
                    payload
                }
                Err(mpsc::error::TrySendError::Closed(payload)) => payload,
            },
            None => payload,
        };

        self.hold_or_drop(payload)
    }

    fn hold_or_drop(&self, payload: Bytes) -> SendOutcome {
        if self.config.offline_policy == OfflinePolicy::Queue {
            let mut queue = self.queue.lock();
            if queue.len() < self.config.queue_capacity {
                queue.push_back(payload);
                self.queued.fetch_add(1, Ordering::Relaxed);
                return SendOutcome::Queued;
            }
            tracing::warn!(
                capacity = self.config.queue_capacity,
                "Upstream offline queue full, dropping message"
            );
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        SendOutcome::Dropped
    }

    /// Open the outbox for a fresh connection, taking over any queued payloads
    fn attach(&self) -> (Vec<Bytes>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(WRITE_BUFFER);

        let mut outbox = self.outbox.lock();
        let pending: Vec<Bytes> = self.queue.lock().drain(..).collect();
        *outbox = Some(tx);
        drop(outbox);

        self.set_state(LinkState::Connected);
        (pending, rx)
    }

    /// Close the outbox; payloads it still holds go through the offline policy
    fn detach(&self, mut rx: mpsc::Receiver<Bytes>) {
        let mut outbox = self.outbox.lock();
        outbox.take();
        rx.close();

        while let Ok(payload) = rx.try_recv() {
            self.hold_or_drop(payload);
        }
        drop(outbox);

        self.set_state(LinkState::Disconnected);
    }

    /// Drive the link until shutdown, reconnecting per policy
    ///
    /// Returns `Ok(())` when shut down or when the link closes with
    /// reconnection disabled. Returns an error if it never connected with
    /// reconnection disabled, or after too many consecutive failures.
    pub async fn run(
        self: Arc<Self>,
        inbound: mpsc::Sender<String>,
        shutdown: CancellationToken,
    ) -> Result<(), UpstreamError> {
        let mut backoff = Backoff::from_config(&self.config.reconnect);
        let address = self.config.address();

        loop {
            self.set_state(LinkState::Connecting);
            tracing::info!(addr = %address, "TCP Socket: connection request");

            let attempt = tokio::select! {
                () = shutdown.cancelled() => break,
                result = TcpStream::connect((self.config.host.as_str(), self.config.port)) => result,
            };

            match attempt {
                Ok(stream) => {
                    backoff.reset();

                    match self.serve(stream, &inbound, &shutdown).await {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::Closed) => tracing::warn!(addr = %address, "TCP Socket: Close"),
                        Err(e) => tracing::warn!(addr = %address, error = %e, "TCP Socket: error"),
                    }

                    if !self.config.reconnect.enabled {
                        tracing::warn!("Upstream reconnection disabled, link stays down");
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.set_state(LinkState::Disconnected);
                    tracing::warn!(addr = %address, error = %e, "TCP Socket: connection failed");

                    if !self.config.reconnect.enabled {
                        return Err(e.into());
                    }
                }
            }

            if let Some(max) = self.config.reconnect.max_attempts {
                if backoff.attempts().saturating_add(1) >= max {
                    tracing::error!(attempts = max, "Giving up on upstream");
                    return Err(UpstreamError::GaveUp { attempts: max });
                }
            }

            let delay = backoff.next_delay();
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempts(),
                "Reconnecting to upstream"
            );

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(LinkState::Disconnected);
        tracing::info!("Upstream link stopped");
        Ok(())
    }

    /// Run one connected session until it closes or shutdown is requested
    ///
    /// The reader and the writer loop run side by side; whichever ends first
    /// ends the session.
    async fn serve(
        &self,
        stream: TcpStream,
        inbound: &mpsc::Sender<String>,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd, UpstreamError> {
        let (read_half, write_half) = stream.into_split();
        let sink = FramedWrite::new(
            write_half,
            LineCodec::new().with_newline(self.config.append_newline),
        );

        let (pending, mut rx) = self.attach();
        tracing::info!(addr = %self.config.address(), "TCP Socket: connected");

        let result = tokio::select! {
            result = self.pump(read_half, inbound, shutdown) => result,
            result = self.write_loop(sink, pending, &mut rx) => result.map(|()| SessionEnd::Closed),
        };

        self.detach(rx);
        result
    }

    /// Write queued payloads first, then everything sent while connected
    async fn write_loop(
        &self,
        mut sink: UpstreamWriter,
        pending: Vec<Bytes>,
        rx: &mut mpsc::Receiver<Bytes>,
    ) -> Result<(), UpstreamError> {
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Flushing queued messages to upstream");
        }

        for (index, payload) in pending.iter().enumerate() {
            if let Err(e) = sink.send(payload.clone()).await {
                // Put back what was not written so the next connection retries it
                let mut queue = self.queue.lock();
                for payload in pending[index..].iter().rev() {
                    queue.push_front(payload.clone());
                }
                return Err(e.into());
            }
            self.written.fetch_add(1, Ordering::Relaxed);
        }

        while let Some(payload) = rx.recv().await {
            if let Err(e) = sink.send(payload.clone()).await {
                tracing::warn!(error = %e, "TCP Socket: write failed");
                self.hold_or_drop(payload);
                return Err(e.into());
            }
            self.written.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    async fn pump(
        &self,
        read_half: OwnedReadHalf,
        inbound: &mpsc::Sender<String>,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd, UpstreamError> {
        let mut lines = FramedRead::new(read_half, LineCodec::new());

        loop {
            let frame = tokio::select! {
                () = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                frame = lines.next() => frame,
            };

            match frame {
                Some(Ok(message)) => {
                    self.received.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(message = %message, "TCP Socket: data received from the server");

                    if inbound.send(message).await.is_err() {
                        // Router is gone, nothing left to deliver to
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(SessionEnd::Closed),
            }
        }
    }
}

impl std::fmt::Debug for UpstreamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamLink")
            .field("address", &self.config.address())
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}
