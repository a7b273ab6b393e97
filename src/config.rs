//! Gateway configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`).

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::bridge::TokenPolicy;

/// Top-level gateway configuration.
///
/// Loaded once at startup via [`GatewayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Socket address for the raw WebSocket listener (e.g. `0.0.0.0:8047`).
    pub ws_listen_addr: SocketAddr,

    /// Socket address for the bridge HTTP server (e.g. `0.0.0.0:8048`).
    pub http_listen_addr: SocketAddr,

    /// Maximum allowed frame payload in bytes. Frames declaring more are a
    /// fatal protocol error for the connection.
    pub max_allowed_packet: usize,

    /// Seconds of bridge-session inactivity before the session is torn
    /// down.
    pub session_idle_timeout_secs: u64,

    /// Seconds a bridge poll request may be held open before it is
    /// answered with an empty terminal payload.
    pub poll_hold_timeout_secs: u64,

    /// How session auth keys are generated (`weak` or `strong`).
    pub auth_token_policy: TokenPolicy,

    /// Optional path to a flash cross-domain policy file served in reply
    /// to the `<policy-file-request/>` sentinel.
    pub flash_policy_file: Option<PathBuf>,
}

impl GatewayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error if `WS_LISTEN_ADDR` or `HTTP_LISTEN_ADDR` is set
    /// but cannot be parsed as a [`SocketAddr`].
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let ws_listen_addr: SocketAddr = std::env::var("WS_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8047".to_string())
            .parse()?;

        let http_listen_addr: SocketAddr = std::env::var("HTTP_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8048".to_string())
            .parse()?;

        let max_allowed_packet = parse_env("MAX_ALLOWED_PACKET", 16 * 1024 * 1024);
        let session_idle_timeout_secs = parse_env("SESSION_IDLE_TIMEOUT_SECS", 120);
        let poll_hold_timeout_secs = parse_env("POLL_HOLD_TIMEOUT_SECS", 30);
        let auth_token_policy = parse_env("AUTH_TOKEN_POLICY", TokenPolicy::Strong);

        let flash_policy_file = std::env::var("FLASH_POLICY_FILE").ok().map(PathBuf::from);

        Ok(Self {
            ws_listen_addr,
            http_listen_addr,
            max_allowed_packet,
            session_idle_timeout_secs,
            poll_hold_timeout_secs,
            auth_token_policy,
            flash_policy_file,
        })
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
