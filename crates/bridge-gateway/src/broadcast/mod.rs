//! Message broadcasting
//!
//! Routes upstream lines to WebSocket clients and client messages to the upstream.

mod router;

pub use router::BroadcastRouter;
