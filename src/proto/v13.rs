//! RFC 6455 dialect (`Sec-WebSocket-Version: 8` / `13`).
//!
//! Handshake: SHA-1 accept key over the client key and the protocol GUID,
//! base64-encoded. Framing: masked client frames, 7/16/64-bit payload
//! length encoding, control frames (close/ping/pong), and fragmented data
//! frames reassembled before dispatch.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! ```

use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};

use super::connection::RequestHead;
use super::{Decoded, FrameKind, HandshakeReply, Step};
use crate::error::GatewayError;

/// RFC 6455 GUID for the Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the Sec-WebSocket-Accept value from a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, GatewayError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(GatewayError::Protocol("reserved opcode")),
        }
    }

    const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Decode progress for one frame, retained across partial reads.
#[derive(Debug)]
enum DecodeState {
    Header,
    ExtendedLength {
        fin: bool,
        opcode: Opcode,
        bytes_needed: usize,
    },
    MaskKey {
        fin: bool,
        opcode: Opcode,
        payload_len: u64,
    },
    Payload {
        fin: bool,
        opcode: Opcode,
        mask_key: [u8; 4],
        payload_len: u64,
    },
}

/// RFC 6455 server-side frame codec.
#[derive(Debug)]
pub struct CodecV13 {
    max_packet: usize,
    state: DecodeState,
    /// Kind of the fragmented message in progress, if any.
    frag_kind: Option<FrameKind>,
    frag_buf: Vec<u8>,
}

impl CodecV13 {
    /// Creates a codec enforcing the given maximum payload size.
    #[must_use]
    pub fn new(max_packet: usize) -> Self {
        Self {
            max_packet,
            state: DecodeState::Header,
            frag_kind: None,
            frag_buf: Vec::new(),
        }
    }

    /// Builds the `101 Switching Protocols` reply. Consumes no body bytes.
    pub fn handshake_reply(&mut self, head: &RequestHead) -> Step<HandshakeReply> {
        let Some(key) = head.header("sec-websocket-key") else {
            return Step::Rejected(GatewayError::HandshakeFailed(
                "missing Sec-WebSocket-Key".to_string(),
            ));
        };
        let accept = accept_key(key);

        let mut response = String::with_capacity(160);
        response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
        response.push_str("Upgrade: websocket\r\n");
        response.push_str("Connection: Upgrade\r\n");
        response.push_str("Sec-WebSocket-Accept: ");
        response.push_str(&accept);
        response.push_str("\r\n");
        // Echo the first offered subprotocol back to the client.
        if let Some(proto) = head.header("sec-websocket-protocol")
            && let Some(first) = proto.split(',').next()
        {
            response.push_str("Sec-WebSocket-Protocol: ");
            response.push_str(first.trim());
            response.push_str("\r\n");
        }
        response.push_str("\r\n");

        Step::Ready(HandshakeReply {
            response: response.into_bytes(),
            consumed: 0,
        })
    }

    /// Post-handshake hook. No buffered negotiation to flush.
    pub fn on_handshake(&mut self) -> bool {
        true
    }

    /// Encodes an unmasked server-to-client data frame.
    #[must_use]
    pub fn encode_data(&self, payload: &[u8], kind: FrameKind) -> Vec<u8> {
        let opcode = match kind {
            FrameKind::String => 0x1,
            FrameKind::Binary => 0x2,
        };
        encode_frame(opcode, payload)
    }

    /// Encodes a close frame with code 1000 (normal closure).
    #[must_use]
    pub fn encode_close(&self) -> Vec<u8> {
        encode_frame(0x8, &1000_u16.to_be_bytes())
    }

    /// Encodes a pong carrying the ping's payload.
    #[must_use]
    pub fn encode_pong(&self, payload: &[u8]) -> Vec<u8> {
        encode_frame(0xA, payload)
    }

    /// Decodes at most one frame, tolerating partial frames across reads.
    ///
    /// # Errors
    ///
    /// Fatal protocol violations: unmasked client frame, reserved bits or
    /// opcode, oversized or fragmented control frame, continuation without
    /// a message in progress, or a payload above the configured maximum.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, GatewayError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let (Some(&b0), Some(&b1)) = (buf.first(), buf.get(1)) else {
                        return Ok(None);
                    };

                    let fin = b0 & 0x80 != 0;
                    if b0 & 0x70 != 0 {
                        return Err(GatewayError::Protocol("reserved bits set"));
                    }
                    let opcode = Opcode::from_u8(b0 & 0x0F)?;
                    let masked = b1 & 0x80 != 0;
                    let len7 = b1 & 0x7F;

                    // Client-to-server frames must be masked.
                    if !masked {
                        return Err(GatewayError::Protocol("unmasked client frame"));
                    }
                    if opcode.is_control() {
                        if !fin {
                            return Err(GatewayError::Protocol("fragmented control frame"));
                        }
                        if len7 > 125 {
                            return Err(GatewayError::Protocol("control frame too large"));
                        }
                    }

                    let _ = buf.split_to(2);

                    self.state = match len7 {
                        126 => DecodeState::ExtendedLength {
                            fin,
                            opcode,
                            bytes_needed: 2,
                        },
                        127 => DecodeState::ExtendedLength {
                            fin,
                            opcode,
                            bytes_needed: 8,
                        },
                        n => {
                            self.check_len(u64::from(n))?;
                            DecodeState::MaskKey {
                                fin,
                                opcode,
                                payload_len: u64::from(n),
                            }
                        }
                    };
                }

                DecodeState::ExtendedLength {
                    fin,
                    opcode,
                    bytes_needed,
                } => {
                    if buf.len() < bytes_needed {
                        return Ok(None);
                    }
                    let raw = buf.split_to(bytes_needed);
                    let payload_len = raw.iter().fold(0_u64, |acc, &b| acc << 8 | u64::from(b));
                    self.check_len(payload_len)?;
                    self.state = DecodeState::MaskKey {
                        fin,
                        opcode,
                        payload_len,
                    };
                }

                DecodeState::MaskKey {
                    fin,
                    opcode,
                    payload_len,
                } => {
                    if buf.len() < 4 {
                        return Ok(None);
                    }
                    let raw = buf.split_to(4);
                    let mut mask_key = [0_u8; 4];
                    mask_key.copy_from_slice(&raw);
                    self.state = DecodeState::Payload {
                        fin,
                        opcode,
                        mask_key,
                        payload_len,
                    };
                }

                DecodeState::Payload {
                    fin,
                    opcode,
                    mask_key,
                    payload_len,
                } => {
                    let need = usize::try_from(payload_len)
                        .map_err(|_| GatewayError::Protocol("payload length overflow"))?;
                    if buf.len() < need {
                        return Ok(None);
                    }
                    let mut payload = buf.split_to(need).to_vec();
                    apply_mask(&mut payload, mask_key);
                    self.state = DecodeState::Header;

                    if let Some(decoded) = self.assemble(fin, opcode, payload)? {
                        return Ok(Some(decoded));
                    }
                    // Non-final fragment absorbed; keep decoding.
                }
            }
        }
    }

    /// Folds one raw frame into the fragmentation state, producing a
    /// [`Decoded`] when a complete message or control frame is available.
    fn assemble(
        &mut self,
        fin: bool,
        opcode: Opcode,
        payload: Vec<u8>,
    ) -> Result<Option<Decoded>, GatewayError> {
        match opcode {
            Opcode::Text | Opcode::Binary => {
                if self.frag_kind.is_some() {
                    return Err(GatewayError::Protocol(
                        "data frame interleaved with fragmented message",
                    ));
                }
                let kind = if opcode == Opcode::Text {
                    FrameKind::String
                } else {
                    FrameKind::Binary
                };
                if fin {
                    return Ok(Some(Decoded::Data { payload, kind }));
                }
                self.frag_kind = Some(kind);
                self.frag_buf = payload;
                Ok(None)
            }
            Opcode::Continuation => {
                let Some(kind) = self.frag_kind else {
                    return Err(GatewayError::Protocol(
                        "continuation without message in progress",
                    ));
                };
                let total = self.frag_buf.len() as u64 + payload.len() as u64;
                self.check_len(total)?;
                self.frag_buf.extend_from_slice(&payload);
                if !fin {
                    return Ok(None);
                }
                self.frag_kind = None;
                Ok(Some(Decoded::Data {
                    payload: std::mem::take(&mut self.frag_buf),
                    kind,
                }))
            }
            Opcode::Ping => Ok(Some(Decoded::Ping(payload))),
            Opcode::Pong => Ok(Some(Decoded::Pong)),
            Opcode::Close => Ok(Some(Decoded::Close)),
        }
    }

    fn check_len(&self, len: u64) -> Result<(), GatewayError> {
        if len > self.max_packet as u64 {
            return Err(GatewayError::PacketTooLarge {
                size: len,
                max: self.max_packet,
            });
        }
        Ok(())
    }
}

/// Encodes one unmasked frame with the given opcode.
fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 10);
    out.push(0x80 | opcode);
    if len <= 125 {
        out.push(len as u8);
    } else if len <= 65535 {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// XOR (un)masking, applied in place. Involution: applying twice restores
/// the input.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (byte, &key) in payload.iter_mut().zip(mask_key.iter().cycle()) {
        *byte ^= key;
    }
}
