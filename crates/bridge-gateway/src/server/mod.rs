//! Bridge server setup
//!
//! Wires the upstream link, router, liveness monitor and listeners together.
//! Listeners open only after the upstream link first connects.

mod handler;
mod state;
mod static_files;

pub use handler::websocket_handler;
pub use state::{BridgeState, DEFAULT_CLIENT_BUFFER};
pub use static_files::{content_type, create_static_app, resolve, StaticFileError};

use crate::broadcast::BroadcastRouter;
use crate::connection::ClientRegistry;
use crate::liveness::LivenessMonitor;
use crate::upstream::{UpstreamError, UpstreamLink};
use axum::{extract::State, routing::get, Json, Router};
use bridge_common::{AppConfig, AppError, AppResult};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Lines buffered between the upstream reader and the router
const INBOUND_BUFFER: usize = 1024;

/// Create the bridge router
pub fn create_router() -> Router<BridgeState> {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/health", get(health_check))
}

/// Health check endpoint
async fn health_check(State(state): State<BridgeState>) -> Json<Value> {
    let upstream = state.upstream();

    Json(json!({
        "status": "ok",
        "upstream": upstream.state(),
        "clients": state.registry().len(),
        "uptime_secs": state.uptime_secs(),
        "traffic": upstream.stats(),
    }))
}

/// Build the complete application
pub fn create_app(state: BridgeState) -> Router {
    create_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ServerTask = JoinHandle<std::io::Result<()>>;

/// A started bridge with its listeners bound
pub struct RunningBridge {
    ws_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    state: BridgeState,
    upstream_task: JoinHandle<Result<(), UpstreamError>>,
    background: Vec<JoinHandle<()>>,
    servers: Vec<ServerTask>,
}

impl RunningBridge {
    /// Bound WebSocket listener address
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    /// Bound static file listener address, when enabled
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn state(&self) -> &BridgeState {
        &self.state
    }

    /// Request shutdown of every task
    pub fn shutdown(&self) {
        self.state.shutdown().cancel();
    }

    /// Wait until the bridge stops
    ///
    /// A link that closes with reconnection disabled stays inert while the
    /// listeners keep serving; giving up on the upstream stops everything.
    pub async fn wait(self) -> AppResult<()> {
        let shutdown = self.state.shutdown().clone();

        let upstream_result = match self.upstream_task.await {
            Ok(result) => result.map_err(AppError::upstream),
            Err(e) => Err(AppError::internal(e)),
        };

        if upstream_result.is_ok() {
            shutdown.cancelled().await;
        } else {
            shutdown.cancel();
        }

        let terminated = self.state.registry().terminate_all();
        if terminated > 0 {
            tracing::info!(clients = terminated, "Closed remaining client sessions");
        }

        for task in self.background {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task failed");
            }
        }

        let mut server_result = Ok(());
        for server in self.servers {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => server_result = Err(AppError::Server(e.to_string())),
                Err(e) => server_result = Err(AppError::internal(e)),
            }
        }

        tracing::info!("Bridge stopped");
        upstream_result.and(server_result)
    }
}

impl std::fmt::Debug for RunningBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningBridge")
            .field("ws_addr", &self.ws_addr)
            .field("http_addr", &self.http_addr)
            .field("state", &self.state)
            .finish()
    }
}

/// Start the bridge
///
/// Resolves once the upstream link has connected and every listener is bound.
pub async fn start(config: AppConfig, shutdown: CancellationToken) -> AppResult<RunningBridge> {
    let upstream = UpstreamLink::new_shared(config.upstream.clone());
    let registry = ClientRegistry::new_shared();
    let router = BroadcastRouter::new_shared(registry.clone(), upstream.clone());

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let mut upstream_task = tokio::spawn(upstream.clone().run(inbound_tx, shutdown.clone()));

    tokio::select! {
        () = upstream.wait_connected() => {}
        result = &mut upstream_task => {
            shutdown.cancel();
            return Err(match result {
                Ok(Ok(())) => AppError::upstream("link closed before it connected"),
                Ok(Err(e)) => AppError::upstream(e),
                Err(e) => AppError::internal(e),
            });
        }
        () = shutdown.cancelled() => {
            return Err(AppError::Server("shutdown requested before upstream connected".to_string()));
        }
    }

    let state = BridgeState::new(router.clone(), shutdown.clone())
        .with_client_buffer(config.websocket.client_buffer);

    let bound = bind_listeners(&config, &state).await;
    let (ws_addr, http_addr, servers) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            shutdown.cancel();
            return Err(e);
        }
    };

    let background = vec![
        router.start(inbound_rx, shutdown.clone()),
        LivenessMonitor::new(registry, config.liveness.ping_interval()).start(shutdown.clone()),
    ];

    Ok(RunningBridge {
        ws_addr,
        http_addr,
        state,
        upstream_task,
        background,
        servers,
    })
}

async fn bind_listeners(
    config: &AppConfig,
    state: &BridgeState,
) -> AppResult<(SocketAddr, Option<SocketAddr>, Vec<ServerTask>)> {
    let ws_listener = bind(&config.websocket.server.address()).await?;
    let ws_addr = ws_listener.local_addr().map_err(AppError::internal)?;

    let app = create_app(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let token = state.shutdown().clone();
    let mut servers = vec![tokio::spawn(async move {
        axum::serve(ws_listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    })];

    tracing::info!("WebSocket server listening on ws://{}/", ws_addr);

    let mut http_addr = None;
    if let Some(static_config) = &config.http {
        let listener = bind(&static_config.server.address()).await?;
        let addr = listener.local_addr().map_err(AppError::internal)?;

        let app = create_static_app(static_config.root.clone());
        let token = state.shutdown().clone();
        servers.push(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        }));

        tracing::info!(root = %static_config.root.display(), "HTTP Server is running on http://{}/", addr);
        http_addr = Some(addr);
    }

    Ok((ws_addr, http_addr, servers))
}

async fn bind(addr: &str) -> AppResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::bind(addr, e))
}

/// Resolve on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("Shutdown signal received");
}

/// Run the bridge until a shutdown signal or a fatal upstream failure
pub async fn run(config: AppConfig) -> AppResult<()> {
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    tracing::info!(upstream = %config.upstream.address(), "Waiting for upstream before opening listeners");

    let bridge = start(config, shutdown).await?;
    bridge.wait().await
}
