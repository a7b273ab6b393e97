//! HTTP surface of the session bridge.
//!
//! Endpoints:
//!
//! - `POST /bridge/{route}/init` — open a session, returns `{"id": ...}`.
//! - `POST /bridge/c2s/{full_id}` — push the request body downstream.
//! - `GET /bridge/poll/{full_id}?js=<name>` — long-poll for packets.
//! - `GET /health` — service health.
//!
//! `c2s` and `poll` answer `200` regardless of authentication outcome;
//! a failed poll simply times out with an empty body, so callers cannot
//! probe for live session ids.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::error::GatewayError;

/// Successful `init` response.
#[derive(Debug, Serialize)]
struct InitResponse {
    /// Composite identifier `processId.sessionId.authKey`.
    id: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
    sessions: usize,
}

/// Poll query parameters.
#[derive(Debug, Deserialize)]
struct PollQuery {
    /// Client response-variable name; selects the batched JSON transport.
    js: Option<String>,
}

/// `POST /bridge/{route}/init` — open a bridge session.
///
/// # Errors
///
/// `404` when the route is not registered, `403` when it refuses the
/// client.
pub async fn init_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(route): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let id = state.bridge.init_session(&route, peer).await?;
    Ok(Json(InitResponse { id }))
}

/// `POST /bridge/c2s/{full_id}` — forward one client message downstream.
pub async fn c2s_handler(
    State(state): State<AppState>,
    Path(full_id): Path<String>,
    body: String,
) -> impl IntoResponse {
    state.bridge.c2s(&full_id, &body).await;
    StatusCode::OK
}

/// `GET /bridge/poll/{full_id}` — long-poll for buffered packets.
///
/// Held open until packets arrive, the session expires, or the configured
/// hold timeout passes; the timeout answer is an empty terminal body
/// indistinguishable from an idle poll.
pub async fn poll_handler(
    State(state): State<AppState>,
    Path(full_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> impl IntoResponse {
    let (request_id, rx) = state.bridge.register_poll(query.js).await;
    state
        .bridge
        .poll(state.bridge.process_id(), request_id, &full_id)
        .await;

    let hold = Duration::from_secs(state.config.poll_hold_timeout_secs);
    let body = match tokio::time::timeout(hold, rx).await {
        Ok(Ok(body)) => body,
        _ => state.bridge.expire_poll(request_id).await,
    };
    (
        [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
        body,
    )
}

/// `GET /health` — service health status.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            sessions: state.bridge.session_count().await,
        }),
    )
}

/// Builds the complete bridge HTTP router.
pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/bridge/{route}/init", post(init_handler))
        .route("/bridge/c2s/{full_id}", post(c2s_handler))
        .route("/bridge/poll/{full_id}", get(poll_handler))
        .route("/health", get(health_handler))
}
