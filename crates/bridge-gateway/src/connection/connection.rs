//! Individual WebSocket client connection
//!
//! Holds the liveness tag and the outbound channel feeding the socket writer task.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Clients are identified by their remote address and port
pub type ClientId = SocketAddr;

/// Liveness tag driven by the ping sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Liveness {
    /// Registered, or answered the last ping
    Alive,
    /// Pinged, no pong seen yet
    AwaitingPong,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Frames queued for the socket writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text message relayed from the upstream
    Text(String),
    /// Protocol-level ping
    Ping,
}

/// Errors delivering to a single client
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientSendError {
    #[error("Connection closed")]
    Closed,

    #[error("Outbound buffer full")]
    Full,
}

/// A single accepted WebSocket session
pub struct ClientConnection {
    id: ClientId,
    liveness: Mutex<Liveness>,
    open: AtomicBool,
    sender: mpsc::Sender<Outbound>,
    terminate: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl ClientConnection {
    /// Create a new connection, Alive and Open
    pub fn new(id: ClientId, sender: mpsc::Sender<Outbound>, terminate: CancellationToken) -> Self {
        Self {
            id,
            liveness: Mutex::new(Liveness::Alive),
            open: AtomicBool::new(true),
            sender,
            terminate,
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn liveness(&self) -> Liveness {
        *self.liveness.lock()
    }

    /// Record a pong
    pub fn mark_alive(&self) {
        *self.liveness.lock() = Liveness::Alive;
    }

    /// Flip the tag to `AwaitingPong`, returning what it was before
    pub fn begin_probe(&self) -> Liveness {
        std::mem::replace(&mut *self.liveness.lock(), Liveness::AwaitingPong)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_open() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    /// Check if the connection still accepts messages
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Mark the connection closed; returns false if it already was
    pub fn close(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }

    /// Close and signal the session task to tear down the socket
    pub fn terminate(&self) {
        self.close();
        self.terminate.cancel();
    }

    /// Token cancelled when the connection is terminated
    pub fn terminated(&self) -> &CancellationToken {
        &self.terminate
    }

    /// Queue a text message without waiting for buffer space
    pub fn try_send_text(&self, text: String) -> Result<(), ClientSendError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(ClientSendError::Closed);
        }

        self.try_send(Outbound::Text(text))
    }

    /// Queue a ping without waiting for buffer space
    pub fn try_ping(&self) -> Result<(), ClientSendError> {
        self.try_send(Outbound::Ping)
    }

    fn try_send(&self, frame: Outbound) -> Result<(), ClientSendError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientSendError::Full,
            mpsc::error::TrySendError::Closed(_) => ClientSendError::Closed,
        })
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("liveness", &self.liveness())
            .field("state", &self.state())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
