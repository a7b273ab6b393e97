//! Gateway error types with HTTP status code mapping.
//!
//! [`GatewayError`] is the central error type for the gateway. Protocol
//! failures on the raw WebSocket listener terminate the connection; errors
//! surfaced through the bridge HTTP API map to a status code and a
//! structured JSON error response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Structured JSON error response body.
///
/// All bridge HTTP error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2001,
///     "message": "unknown route: chat",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server-side error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category             | HTTP Status                |
/// |-----------|----------------------|----------------------------|
/// | 1000–1999 | Malformed input      | 400 Bad Request            |
/// | 2000–2999 | Route/session lookup | 404 Not Found / 403        |
/// | 3000–3999 | Server               | 500 Internal Server Error  |
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The client sent something that does not parse as an HTTP upgrade
    /// request (request line or header line).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The client asked for a WebSocket protocol version the gateway does
    /// not speak.
    #[error("websocket version {0} is not supported")]
    UnsupportedVersion(String),

    /// The selected dialect could not complete its handshake.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// No route is registered under the requested path segment.
    #[error("unknown route: {0}")]
    RouteNotFound(String),

    /// A registered route refused to produce a handler for this client.
    #[error("route rejected connection: {0}")]
    RouteRejected(String),

    /// Session id unknown or auth key mismatch. Deliberately carries no
    /// detail; bridge operations drop it silently.
    #[error("session authentication failed")]
    SessionAuth,

    /// A frame declared a payload larger than the configured maximum.
    #[error("packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge {
        /// Declared payload size in bytes.
        size: u64,
        /// Configured maximum in bytes.
        max: usize,
    },

    /// Framing-level protocol violation.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// I/O failure on the underlying socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal inconsistency (e.g. no codec bound after handshake).
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::BadRequest(_) => 1001,
            Self::UnsupportedVersion(_) => 1002,
            Self::HandshakeFailed(_) => 1003,
            Self::PacketTooLarge { .. } => 1004,
            Self::Protocol(_) => 1005,
            Self::RouteNotFound(_) => 2001,
            Self::RouteRejected(_) => 2002,
            Self::SessionAuth => 2003,
            Self::Io(_) => 3001,
            Self::Internal(_) => 3000,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_)
            | Self::UnsupportedVersion(_)
            | Self::HandshakeFailed(_)
            | Self::PacketTooLarge { .. }
            | Self::Protocol(_) => StatusCode::BAD_REQUEST,
            Self::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Self::RouteRejected(_) | Self::SessionAuth => StatusCode::FORBIDDEN,
            Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
