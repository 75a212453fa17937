//! Broadcast router
//!
//! Fans every upstream line out to the open clients and relays client
//! messages back to the upstream link.

use crate::connection::{ClientId, ClientRegistry, ClientSendError};
use crate::upstream::{SendOutcome, UpstreamLink};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Composition point between the upstream link and the client set
pub struct BroadcastRouter {
    registry: Arc<ClientRegistry>,
    upstream: Arc<UpstreamLink>,
    broadcasts: AtomicU64,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ClientRegistry>, upstream: Arc<UpstreamLink>) -> Self {
        Self {
            registry,
            upstream,
            broadcasts: AtomicU64::new(0),
        }
    }

    pub fn new_shared(registry: Arc<ClientRegistry>, upstream: Arc<UpstreamLink>) -> Arc<Self> {
        Arc::new(Self::new(registry, upstream))
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn upstream(&self) -> &Arc<UpstreamLink> {
        &self.upstream
    }

    /// Messages fanned out so far
    pub fn broadcasts(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    /// Deliver one message to every open client
    ///
    /// Returns how many clients accepted it. Delivery never waits on a slow
    /// client: one whose buffer is full misses this message, and a failing
    /// client never stops delivery to the others.
    pub fn fan_out(&self, message: &str) -> usize {
        let targets = self.registry.open_connections();
        let mut sent = 0;

        for conn in &targets {
            match conn.try_send_text(message.to_owned()) {
                Ok(()) => sent += 1,
                Err(ClientSendError::Full) => {
                    tracing::warn!(client = %conn.id(), "Client too slow, broadcast skipped");
                }
                Err(ClientSendError::Closed) => {
                    tracing::debug!(client = %conn.id(), "Skipping closed client during broadcast");
                }
            }
        }

        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(targets = targets.len(), sent = sent, "Broadcast delivered");
        sent
    }

    /// Relay a client message to the upstream unmodified
    ///
    /// Never waits on the upstream socket, so a stalled backend cannot hold
    /// up the calling session.
    pub fn to_upstream(&self, from: ClientId, payload: impl Into<Bytes>) -> SendOutcome {
        let outcome = self.upstream.send(payload);

        match outcome {
            SendOutcome::Sent => tracing::trace!(client = %from, "Relayed to upstream"),
            SendOutcome::Queued => tracing::debug!(client = %from, "Upstream offline, message queued"),
            SendOutcome::Dropped => tracing::debug!(client = %from, "Upstream unavailable, message dropped"),
        }

        outcome
    }

    /// Start the router task
    ///
    /// Messages are fanned out one at a time in arrival order.
    pub fn start(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<String>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Broadcast router started");

            loop {
                let message = tokio::select! {
                    () = shutdown.cancelled() => break,
                    message = inbound.recv() => message,
                };

                match message {
                    Some(message) => {
                        self.fan_out(&message);
                    }
                    None => {
                        tracing::debug!("Upstream channel closed");
                        break;
                    }
                }
            }

            tracing::info!("Broadcast router stopped");
        })
    }
}

impl std::fmt::Debug for BroadcastRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastRouter")
            .field("clients", &self.registry.len())
            .field("broadcasts", &self.broadcasts())
            .finish()
    }
}
