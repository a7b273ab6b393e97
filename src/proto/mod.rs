//! Wire-protocol core: per-dialect frame codecs, dialect negotiation, and
//! the per-connection state machine.
//!
//! Three handshake dialects are supported:
//!
//! - [`v13`] — RFC 6455 framing (`Sec-WebSocket-Version: 8` or `13`).
//! - [`v0`] — Hixie-76 numeric-key challenge with sentinel framing.
//! - [`ve`] — the early key-less handshake, sharing v0's framing.
//!
//! [`connection::Connection`] drives one client through HTTP upgrade
//! parsing, negotiation ([`handshake`]) and framed dispatch. The whole
//! layer is sans-io: it consumes byte slices and emits events, so every
//! state is reachable in tests without a socket.

pub mod connection;
pub mod handshake;
pub mod v0;
pub mod v13;
pub mod ve;

use bytes::BytesMut;
use serde::Serialize;

use crate::error::GatewayError;
use connection::RequestHead;

/// Frame payload kind, preserved end-to-end between WebSocket clients and
/// bridge polling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameKind {
    /// Text payload (`STRING` on the wire and in bridge payloads).
    String,
    /// Binary payload.
    Binary,
}

/// Tri-state outcome of a resumable parsing step.
///
/// `Incomplete` suspends the caller without consuming state; the step is
/// retried when more bytes arrive.
#[derive(Debug)]
pub enum Step<T> {
    /// The step completed and produced a value.
    Ready(T),
    /// Not enough buffered data yet; retry on the next read.
    Incomplete,
    /// The step failed terminally.
    Rejected(GatewayError),
}

/// A dialect's handshake reply: raw response bytes plus how many buffered
/// body bytes the challenge consumed.
#[derive(Debug)]
pub struct HandshakeReply {
    /// Bytes to write verbatim to the socket.
    pub response: Vec<u8>,
    /// Body bytes consumed from the handshake scratch buffer.
    pub consumed: usize,
}

/// One decoded inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A data frame to deliver to the route.
    Data {
        /// Unmasked payload bytes.
        payload: Vec<u8>,
        /// Payload kind.
        kind: FrameKind,
    },
    /// A ping control frame (v13 only); the connection answers with pong.
    Ping(Vec<u8>),
    /// A pong control frame; ignored.
    Pong,
    /// The peer initiated connection close.
    Close,
}

/// The frame codec bound to a connection once dialect negotiation has run.
///
/// At most one codec is ever bound per connection; the closed set of
/// variants mirrors the dialects the negotiator can select.
#[derive(Debug)]
pub enum FrameCodec {
    /// RFC 6455 dialect.
    V13(v13::CodecV13),
    /// Hixie-76 numeric-key dialect.
    V0(v0::CodecV0),
    /// Early key-less dialect.
    Ve(ve::CodecVe),
}

impl FrameCodec {
    /// Short dialect name for logging.
    #[must_use]
    pub const fn dialect(&self) -> &'static str {
        match self {
            Self::V13(_) => "v13",
            Self::V0(_) => "v0",
            Self::Ve(_) => "ve",
        }
    }

    /// Computes the handshake reply from the parsed request head and the
    /// buffered handshake body bytes.
    pub fn handshake_reply(&mut self, head: &RequestHead, body: &[u8]) -> Step<HandshakeReply> {
        match self {
            Self::V13(c) => c.handshake_reply(head),
            Self::V0(c) => c.handshake_reply(head, body),
            Self::Ve(c) => c.handshake_reply(head),
        }
    }

    /// Post-handshake hook. Returning `false` aborts the connection.
    pub fn on_handshake(&mut self) -> bool {
        match self {
            Self::V13(c) => c.on_handshake(),
            Self::V0(_) | Self::Ve(_) => true,
        }
    }

    /// Encodes an outbound data frame.
    #[must_use]
    pub fn encode_data(&self, payload: &[u8], kind: FrameKind) -> Vec<u8> {
        match self {
            Self::V13(c) => c.encode_data(payload, kind),
            Self::V0(_) | Self::Ve(_) => v0::encode_legacy_data(payload, kind),
        }
    }

    /// Encodes a close frame for this dialect.
    #[must_use]
    pub fn encode_close(&self) -> Vec<u8> {
        match self {
            Self::V13(c) => c.encode_close(),
            Self::V0(_) | Self::Ve(_) => v0::encode_legacy_close(),
        }
    }

    /// Encodes a pong answering the given ping payload, for dialects that
    /// have control frames.
    #[must_use]
    pub fn encode_pong(&self, payload: &[u8]) -> Option<Vec<u8>> {
        match self {
            Self::V13(c) => Some(c.encode_pong(payload)),
            Self::V0(_) | Self::Ve(_) => None,
        }
    }

    /// Decodes at most one frame from `buf`, consuming exactly the bytes
    /// of that frame. `Ok(None)` means a partial frame is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PacketTooLarge`] when a frame declares more
    /// than the configured maximum, or [`GatewayError::Protocol`] on a
    /// framing violation. Both are fatal for the connection.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, GatewayError> {
        match self {
            Self::V13(c) => c.decode(buf),
            Self::V0(c) => c.decode(buf),
            Self::Ve(c) => c.decode(buf),
        }
    }
}
