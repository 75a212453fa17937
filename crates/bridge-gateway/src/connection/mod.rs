//! Connection management
//!
//! Client sessions and the registry shared by the router, the WebSocket
//! endpoint and the liveness monitor.

mod connection;
mod registry;

pub use connection::{ClientConnection, ClientId, ClientSendError, ConnectionState, Liveness, Outbound};
pub use registry::ClientRegistry;
