//! # bridge-gateway
//!
//! Broadcast bridge between one upstream TCP link and many WebSocket clients.
//!
//! Every line read from the upstream is relayed to every open client, and
//! every client message is written to the upstream unmodified.

pub mod broadcast;
pub mod connection;
pub mod liveness;
pub mod server;
pub mod upstream;

pub use server::{run, start, RunningBridge};
