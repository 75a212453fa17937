//! WebSocket handler
//!
//! Accepts client sessions, relays their messages upstream and feeds them
//! broadcasts and pings from their outbound channel.

use crate::connection::{ClientConnection, Outbound};
use crate::server::BridgeState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// How a client session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Close frame or end of stream from the client
    ClientClosed,
    /// Read error or malformed frame
    ProtocolError,
    /// Writing to the socket failed
    WriteFailed,
    /// Evicted by the liveness monitor, replaced, or shut down
    Terminated,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    State(state): State<BridgeState>,
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, addr, socket))
}

/// Handle an upgraded WebSocket connection
async fn handle_socket(state: BridgeState, addr: SocketAddr, socket: WebSocket) {
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.client_buffer());
    let terminate = state.shutdown().child_token();

    let connection = state.registry().register(addr, tx, terminate.clone());

    tracing::info!(client = %addr, "WebSocket.Server: New connection");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Outbound: broadcasts and pings
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Ping => Message::Ping(Vec::new()),
            };

            if ws_sink.send(message).await.is_err() {
                return SessionEnd::WriteFailed;
            }
        }

        let _ = ws_sink.close().await;
        SessionEnd::Terminated
    });

    // Inbound: relay to upstream, track pongs
    let recv_state = state.clone();
    let recv_connection = connection.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    tracing::debug!(client = %addr, message = %text, "WebSocket message");
                    recv_state.router().to_upstream(addr, text);
                }
                Ok(Message::Binary(data)) => {
                    tracing::debug!(client = %addr, bytes = data.len(), "WebSocket binary message");
                    recv_state.router().to_upstream(addr, data);
                }
                Ok(Message::Ping(_)) => {
                    // Pong reply is handled by axum
                    tracing::trace!(client = %addr, "Ping received");
                }
                Ok(Message::Pong(_)) => {
                    tracing::debug!(client = %addr, "WebSocket: Pong");
                    recv_connection.mark_alive();
                }
                Ok(Message::Close(_)) => return SessionEnd::ClientClosed,
                Err(e) => {
                    tracing::warn!(client = %addr, error = %e, "WebSocket: Error");
                    return SessionEnd::ProtocolError;
                }
            }
        }

        SessionEnd::ClientClosed
    });

    let send_abort = send_task.abort_handle();
    let recv_abort = recv_task.abort_handle();

    let end = tokio::select! {
        result = recv_task => result.unwrap_or(SessionEnd::ProtocolError),
        result = send_task => result.unwrap_or(SessionEnd::WriteFailed),
        () = terminate.cancelled() => SessionEnd::Terminated,
    };

    send_abort.abort();
    recv_abort.abort();

    cleanup_connection(&state, &connection, end);
}

/// Drop a finished session from the registry
fn cleanup_connection(state: &BridgeState, connection: &Arc<ClientConnection>, end: SessionEnd) {
    connection.close();
    state.registry().remove(connection);

    match end {
        SessionEnd::ProtocolError | SessionEnd::WriteFailed => {
            tracing::warn!(client = %connection.id(), reason = ?end, "WebSocket: Close");
        }
        SessionEnd::ClientClosed | SessionEnd::Terminated => {
            tracing::info!(client = %connection.id(), reason = ?end, "WebSocket: Close");
        }
    }
}
