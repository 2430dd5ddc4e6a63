//! # causerie-server
//!
//! Chat broker for Causerie clients.
//!
//! This binary provides:
//! - **WebSocket endpoint** at `/chat-websocket` carrying the client
//!   frames (connect, subscribe, send, disconnect)
//! - **Presence list** broadcast on every join and leave
//! - **Private routing** of direct messages, files and call signaling
//! - **REST API** (axum) for health checks and the current user list

use tracing::info;
use tracing_subscriber::EnvFilter;

use causerie_server::{api, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,causerie_server=debug")),
        )
        .init();

    info!("Starting Causerie broker v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        instance = %config.instance_name,
        max_frame_bytes = config.max_frame_bytes,
        "Configuration loaded"
    );
    let http_addr = config.http_addr;

    // -----------------------------------------------------------------------
    // 3. Run the broker (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(AppState::new(config), http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
