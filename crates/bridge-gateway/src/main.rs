//! TCP to WebSocket bridge entry point
//!
//! Run with:
//! ```bash
//! cargo run -p bridge-gateway
//! ```
//!
//! Configuration is loaded from environment variables.

use bridge_common::{try_init_tracing, try_init_tracing_with_config, AppConfig, TracingConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            let _ = try_init_tracing();
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = try_init_tracing_with_config(TracingConfig::for_environment(config.app.env)) {
        eprintln!("Warning: Failed to initialize tracing: {e}");
    }

    info!(
        name = %config.app.name,
        env = ?config.app.env,
        upstream = %config.upstream.address(),
        ws = %config.websocket.server.address(),
        static_root = ?config.http.as_ref().map(|http| http.root.display().to_string()),
        "Configuration loaded"
    );

    if let Err(e) = bridge_gateway::run(config).await {
        error!(
            error = %e,
            code = e.error_code(),
            transient = e.is_transient(),
            "Bridge failed"
        );
        std::process::exit(1);
    }
}
