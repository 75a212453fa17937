//! Bridge state
//!
//! Shared handles for the HTTP and WebSocket handlers.

use crate::broadcast::BroadcastRouter;
use crate::connection::ClientRegistry;
use crate::upstream::UpstreamLink;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default per-client outbound buffer
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Bridge application state
#[derive(Clone)]
pub struct BridgeState {
    registry: Arc<ClientRegistry>,
    router: Arc<BroadcastRouter>,
    shutdown: CancellationToken,
    client_buffer: usize,
    started_at: DateTime<Utc>,
}

impl BridgeState {
    /// Create a new bridge state around a router
    pub fn new(router: Arc<BroadcastRouter>, shutdown: CancellationToken) -> Self {
        Self {
            registry: router.registry().clone(),
            router,
            shutdown,
            client_buffer: DEFAULT_CLIENT_BUFFER,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_client_buffer(mut self, client_buffer: usize) -> Self {
        self.client_buffer = client_buffer.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }

    pub fn upstream(&self) -> &Arc<UpstreamLink> {
        self.router.upstream()
    }

    /// Process-wide shutdown token; client sessions hang child tokens off it
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn client_buffer(&self) -> usize {
        self.client_buffer
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whole seconds since the state was created
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

impl std::fmt::Debug for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeState")
            .field("registry", &self.registry)
            .field("upstream", &self.upstream().state())
            .field("client_buffer", &self.client_buffer)
            .finish()
    }
}
