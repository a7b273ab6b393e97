//! comet-gateway server entry point.
//!
//! Starts the raw WebSocket listener and the bridge HTTP server, then
//! waits for ctrl-c to begin graceful shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use comet_gateway::app_state::AppState;
use comet_gateway::config::GatewayConfig;
use comet_gateway::route::echo::EchoRoute;
use comet_gateway::route::{RouteProvider, RouteRegistry};
use comet_gateway::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = GatewayConfig::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    tracing::info!(
        ws = %config.ws_listen_addr,
        http = %config.http_listen_addr,
        "starting comet-gateway"
    );

    // Register routes
    let mut registry = RouteRegistry::new();
    registry.register("echo", RouteProvider::Constructor(EchoRoute::boxed))?;
    let registry = Arc::new(registry);

    let state = AppState::new(config, registry);

    // Shutdown signal shared by both listeners
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ws_task = tokio::spawn(server::run_ws_listener(state.clone(), shutdown_rx.clone()));
    let http_task = tokio::spawn(server::run_http_server(state, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    ws_task.await??;
    http_task.await??;

    Ok(())
}
