//! Shared application state injected into all Axum handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::bridge::SessionBridge;
use crate::config::GatewayConfig;
use crate::route::RouteRegistry;

/// Shared application state available to all handlers via Axum's
/// `State` extractor and to the raw WebSocket listener.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Loaded gateway configuration.
    pub config: Arc<GatewayConfig>,
    /// Route name → provider mapping, immutable after startup.
    pub registry: Arc<RouteRegistry>,
    /// The COMET session multiplexer.
    pub bridge: Arc<SessionBridge>,
}

impl AppState {
    /// Builds state from loaded configuration and a populated registry.
    #[must_use]
    pub fn new(config: GatewayConfig, registry: Arc<RouteRegistry>) -> Self {
        let bridge = Arc::new(SessionBridge::new(
            Arc::clone(&registry),
            Duration::from_secs(config.session_idle_timeout_secs),
            config.auth_token_policy,
        ));
        Self {
            config: Arc::new(config),
            registry,
            bridge,
        }
    }
}
