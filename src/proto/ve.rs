//! Early/experimental dialect: key-less handshake, legacy framing.
//!
//! Selected when the client sends neither `Sec-WebSocket-Version` nor the
//! Hixie-76 numeric key pair. The reply carries no challenge digest; the
//! wire format is the sentinel framing shared with [`super::v0`].

use bytes::BytesMut;

use super::connection::RequestHead;
use super::{Decoded, HandshakeReply, Step, v0};
use crate::error::GatewayError;

/// Key-less early-dialect codec.
#[derive(Debug)]
pub struct CodecVe {
    max_packet: usize,
}

impl CodecVe {
    /// Creates a codec enforcing the given maximum payload size.
    #[must_use]
    pub const fn new(max_packet: usize) -> Self {
        Self { max_packet }
    }

    /// Builds the key-less reply. Needs no body bytes and consumes none.
    pub fn handshake_reply(&mut self, head: &RequestHead) -> Step<HandshakeReply> {
        let mut response = String::with_capacity(160);
        response.push_str("HTTP/1.1 101 Web Socket Protocol Handshake\r\n");
        response.push_str("Upgrade: WebSocket\r\n");
        response.push_str("Connection: Upgrade\r\n");
        response.push_str("WebSocket-Origin: ");
        response.push_str(head.header("origin").unwrap_or("null"));
        response.push_str("\r\n");
        response.push_str("WebSocket-Location: ws://");
        response.push_str(&head.host());
        response.push_str(&head.request_uri());
        response.push_str("\r\n\r\n");

        Step::Ready(HandshakeReply {
            response: response.into_bytes(),
            consumed: 0,
        })
    }

    /// Decodes at most one legacy frame.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`v0::CodecV0::decode`].
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, GatewayError> {
        v0::decode_legacy(buf, self.max_packet)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn reply_is_ready_without_body() {
        let peer: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        let mut head = RequestHead::new(peer);
        head.path = "/chat".to_string();
        head.headers
            .insert("host".to_string(), "gw.local".to_string());

        let mut codec = CodecVe::new(1024);
        let Step::Ready(reply) = codec.handshake_reply(&head) else {
            panic!("expected a ready handshake reply");
        };
        assert_eq!(reply.consumed, 0);
        let text = String::from_utf8_lossy(&reply.response);
        assert!(text.starts_with("HTTP/1.1 101 Web Socket Protocol Handshake"));
        assert!(text.contains("WebSocket-Location: ws://gw.local/chat"));
        assert!(text.contains("WebSocket-Origin: null"));
    }
}
