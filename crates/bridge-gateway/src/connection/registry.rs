//! Client registry
//!
//! Tracks every open client session using DashMap for thread-safe access.

use super::{ClientConnection, ClientId, Outbound};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The live set of connected WebSocket sessions
///
/// Written by session tasks and the liveness monitor, read by the router on
/// every upstream message.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientConnection>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    #[must_use]
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection
    ///
    /// A stale entry with the same address is terminated and replaced.
    pub fn register(
        &self,
        id: ClientId,
        sender: mpsc::Sender<Outbound>,
        terminate: CancellationToken,
    ) -> Arc<ClientConnection> {
        let connection = Arc::new(ClientConnection::new(id, sender, terminate));

        if let Some(previous) = self.clients.insert(id, connection.clone()) {
            tracing::warn!(client = %id, "Replacing stale connection");
            previous.terminate();
        }

        tracing::debug!(client = %id, total = self.clients.len(), "Client registered");
        connection
    }

    /// Remove a connection
    ///
    /// Only removes the exact entry passed in, so a late removal never evicts
    /// a newer connection from the same address. Returns false if it was
    /// already gone.
    pub fn remove(&self, connection: &Arc<ClientConnection>) -> bool {
        let removed = self
            .clients
            .remove_if(&connection.id(), |_, current| Arc::ptr_eq(current, connection))
            .is_some();

        connection.close();

        if removed {
            tracing::debug!(client = %connection.id(), total = self.clients.len(), "Client removed");
        }

        removed
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<ClientConnection>> {
        self.clients.get(id).map(|r| r.clone())
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Snapshot of every registered connection
    ///
    /// Iterating the snapshot holds no shard locks, so sessions may come and go meanwhile.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of connections still open
    pub fn open_connections(&self) -> Vec<Arc<ClientConnection>> {
        self.clients
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Terminate and drop every connection
    pub fn terminate_all(&self) -> usize {
        let connections = self.snapshot();
        for connection in &connections {
            connection.terminate();
            self.remove(connection);
        }
        connections.len()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.len())
            .finish()
    }
}
