//! Dialect selection over the parsed upgrade request headers.
//!
//! Evaluated in order:
//!
//! 1. `Sec-WebSocket-Version` present — `8` or `13` selects [`v13`];
//!    anything else is rejected as unsupported.
//! 2. Both `Sec-WebSocket-Key1` and `Sec-WebSocket-Key2` present —
//!    selects the Hixie-76 [`v0`] dialect.
//! 3. Otherwise the early key-less [`ve`] dialect.

use super::connection::RequestHead;
use super::{FrameCodec, v0, v13, ve};
use crate::error::GatewayError;

/// Selects the frame codec for this request, or rejects the upgrade.
///
/// # Errors
///
/// Returns [`GatewayError::UnsupportedVersion`] when the client declares a
/// `Sec-WebSocket-Version` the gateway does not speak.
pub fn select_codec(head: &RequestHead, max_packet: usize) -> Result<FrameCodec, GatewayError> {
    if let Some(version) = head.header("sec-websocket-version") {
        return match version.trim() {
            "8" | "13" => Ok(FrameCodec::V13(v13::CodecV13::new(max_packet))),
            other => Err(GatewayError::UnsupportedVersion(other.to_string())),
        };
    }

    if head.header("sec-websocket-key1").is_some() && head.header("sec-websocket-key2").is_some() {
        return Ok(FrameCodec::V0(v0::CodecV0::new(max_packet)));
    }

    Ok(FrameCodec::Ve(ve::CodecVe::new(max_packet)))
}
