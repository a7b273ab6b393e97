//! Hixie-76 dialect (`Sec-WebSocket-Key1`/`Key2` numeric-key challenge).
//!
//! The handshake reply is an MD5 digest over the two key numbers (digits
//! divided by the space count, packed big-endian) and the 8-byte body
//! token. Framing is legacy: text frames are delimited by a `0x00` lead
//! byte and `0xFF` trailer; binary frames carry a high-bit lead byte and a
//! 7-bit-group length prefix; `0xFF 0x00` closes.

use bytes::{Buf, BytesMut};
use md5::{Digest, Md5};

use super::connection::RequestHead;
use super::{Decoded, FrameKind, HandshakeReply, Step};
use crate::error::GatewayError;

/// Hixie-76 server-side codec.
#[derive(Debug)]
pub struct CodecV0 {
    max_packet: usize,
}

impl CodecV0 {
    /// Creates a codec enforcing the given maximum payload size.
    #[must_use]
    pub const fn new(max_packet: usize) -> Self {
        Self { max_packet }
    }

    /// Builds the challenge reply. Suspends until the 8-byte body token is
    /// buffered; consumes exactly those 8 bytes.
    pub fn handshake_reply(&mut self, head: &RequestHead, body: &[u8]) -> Step<HandshakeReply> {
        let Some(token) = body.get(..8) else {
            return Step::Incomplete;
        };

        let (Some(key1), Some(key2)) = (
            head.header("sec-websocket-key1"),
            head.header("sec-websocket-key2"),
        ) else {
            return Step::Rejected(GatewayError::HandshakeFailed(
                "missing numeric challenge keys".to_string(),
            ));
        };
        let (Some(part1), Some(part2)) = (key_number(key1), key_number(key2)) else {
            return Step::Rejected(GatewayError::HandshakeFailed(
                "malformed numeric challenge key".to_string(),
            ));
        };

        let mut hasher = Md5::new();
        hasher.update(part1.to_be_bytes());
        hasher.update(part2.to_be_bytes());
        hasher.update(token);
        let digest = hasher.finalize();

        let mut response = String::with_capacity(200);
        response.push_str("HTTP/1.1 101 WebSocket Protocol Handshake\r\n");
        response.push_str("Upgrade: WebSocket\r\n");
        response.push_str("Connection: Upgrade\r\n");
        response.push_str("Sec-WebSocket-Origin: ");
        response.push_str(head.header("origin").unwrap_or("null"));
        response.push_str("\r\n");
        response.push_str("Sec-WebSocket-Location: ws://");
        response.push_str(&head.host());
        response.push_str(&head.request_uri());
        response.push_str("\r\n");
        if let Some(proto) = head.header("sec-websocket-protocol")
            && let Some(first) = proto.split(',').next()
        {
            response.push_str("Sec-WebSocket-Protocol: ");
            response.push_str(first.trim());
            response.push_str("\r\n");
        }
        response.push_str("\r\n");

        let mut bytes = response.into_bytes();
        bytes.extend_from_slice(&digest);

        Step::Ready(HandshakeReply {
            response: bytes,
            consumed: 8,
        })
    }

    /// Decodes at most one legacy frame.
    ///
    /// # Errors
    ///
    /// Fatal protocol violations: unknown lead byte or a frame above the
    /// configured maximum.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, GatewayError> {
        decode_legacy(buf, self.max_packet)
    }
}

/// Extracts a Hixie-76 key number: the embedded digits divided by the
/// space count. `None` when the key has no spaces, the digits do not
/// divide evenly, or the quotient overflows 32 bits.
fn key_number(key: &str) -> Option<u32> {
    let digits: String = key.chars().filter(char::is_ascii_digit).collect();
    let spaces = key.chars().filter(|&c| c == ' ').count() as u64;
    if spaces == 0 {
        return None;
    }
    let number: u64 = digits.parse().ok()?;
    if number % spaces != 0 {
        return None;
    }
    u32::try_from(number / spaces).ok()
}

/// Encodes a legacy data frame: sentinel-delimited for text, 7-bit-group
/// length-prefixed for binary.
#[must_use]
pub fn encode_legacy_data(payload: &[u8], kind: FrameKind) -> Vec<u8> {
    match kind {
        FrameKind::String => {
            let mut out = Vec::with_capacity(payload.len() + 2);
            out.push(0x00);
            out.extend_from_slice(payload);
            out.push(0xFF);
            out
        }
        FrameKind::Binary => {
            let mut out = Vec::with_capacity(payload.len() + 10);
            out.push(0x80);
            encode_legacy_length(payload.len() as u64, &mut out);
            out.extend_from_slice(payload);
            out
        }
    }
}

/// Encodes the legacy closing handshake (`0xFF 0x00`).
#[must_use]
pub fn encode_legacy_close() -> Vec<u8> {
    vec![0xFF, 0x00]
}

/// Writes a length as big-endian 7-bit groups, high bit set on all but
/// the last byte.
fn encode_legacy_length(len: u64, out: &mut Vec<u8>) {
    let mut groups = [0_u8; 10];
    let mut idx = groups.len();
    let mut rest = len;
    loop {
        idx = idx.saturating_sub(1);
        if let Some(slot) = groups.get_mut(idx) {
            *slot = (rest & 0x7F) as u8;
        }
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    let tail = groups.len() - 1;
    for (pos, &g) in groups.iter().enumerate().skip(idx) {
        if pos == tail {
            out.push(g);
        } else {
            out.push(0x80 | g);
        }
    }
}

/// Decodes at most one legacy frame from `buf`. Shared by the v0 and ve
/// dialects.
///
/// # Errors
///
/// Fatal protocol violations: a lead byte that is neither `0x00` nor
/// high-bit, an over-long length prefix, or a frame above `max`.
pub(crate) fn decode_legacy(
    buf: &mut BytesMut,
    max: usize,
) -> Result<Option<Decoded>, GatewayError> {
    let Some(&lead) = buf.first() else {
        return Ok(None);
    };

    if lead & 0x80 != 0 {
        // Length-delimited frame.
        let mut len: u64 = 0;
        let mut idx = 1_usize;
        loop {
            let Some(&b) = buf.get(idx) else {
                return Ok(None);
            };
            len = len
                .checked_mul(128)
                .ok_or(GatewayError::Protocol("over-long legacy length prefix"))?
                | u64::from(b & 0x7F);
            idx += 1;
            if b & 0x80 == 0 {
                break;
            }
            if idx > 10 {
                return Err(GatewayError::Protocol("over-long legacy length prefix"));
            }
        }
        if len > max as u64 {
            return Err(GatewayError::PacketTooLarge {
                size: len,
                max,
            });
        }
        let need = idx + len as usize;
        if buf.len() < need {
            return Ok(None);
        }
        buf.advance(idx);
        let payload = buf.split_to(len as usize).to_vec();
        if lead == 0xFF && payload.is_empty() {
            return Ok(Some(Decoded::Close));
        }
        Ok(Some(Decoded::Data {
            payload,
            kind: FrameKind::Binary,
        }))
    } else {
        if lead != 0x00 {
            return Err(GatewayError::Protocol("unknown legacy frame lead byte"));
        }
        // Sentinel-delimited text frame: scan for the 0xFF trailer.
        let Some(end) = buf.iter().skip(1).position(|&b| b == 0xFF) else {
            if buf.len() > max + 2 {
                return Err(GatewayError::PacketTooLarge {
                    size: buf.len() as u64,
                    max,
                });
            }
            return Ok(None);
        };
        buf.advance(1);
        let payload = buf.split_to(end).to_vec();
        buf.advance(1);
        Ok(Some(Decoded::Data {
            payload,
            kind: FrameKind::String,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::proto::connection::RequestHead;
    use std::net::SocketAddr;

    fn head_with(pairs: &[(&str, &str)]) -> RequestHead {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut head = RequestHead::new(peer);
        head.path = "/demo".to_string();
        for (name, value) in pairs {
            head.headers
                .insert((*name).to_string(), (*value).to_string());
        }
        head
    }

    #[test]
    fn key_number_matches_draft_examples() {
        assert_eq!(
            key_number("18x 6]8vM;54 *(5:  {   U1]8  z [  8"),
            Some(155_712_099)
        );
        assert_eq!(
            key_number("1_ tx7X d  <  nw  334J702) 7]o}` 0"),
            Some(173_347_027)
        );
    }

    #[test]
    fn key_number_without_spaces_is_rejected() {
        assert_eq!(key_number("12345"), None);
    }

    #[test]
    fn challenge_reply_matches_draft_vector() {
        let mut codec = CodecV0::new(1024);
        let head = head_with(&[
            ("host", "example.com"),
            ("origin", "http://example.com"),
            ("sec-websocket-key1", "18x 6]8vM;54 *(5:  {   U1]8  z [  8"),
            ("sec-websocket-key2", "1_ tx7X d  <  nw  334J702) 7]o}` 0"),
        ]);
        let Step::Ready(reply) = codec.handshake_reply(&head, b"Tm[K T2u") else {
            panic!("expected a ready handshake reply");
        };
        assert_eq!(reply.consumed, 8);
        assert!(reply.response.ends_with(b"fQJ,fN/4F4!~K~MH"));
        let text = String::from_utf8_lossy(&reply.response);
        assert!(text.contains("Sec-WebSocket-Location: ws://example.com/demo"));
        assert!(text.contains("Sec-WebSocket-Origin: http://example.com"));
    }

    #[test]
    fn reply_suspends_until_body_token_arrives() {
        let mut codec = CodecV0::new(1024);
        let head = head_with(&[
            ("sec-websocket-key1", "1 2"),
            ("sec-websocket-key2", "3 4"),
        ]);
        assert!(matches!(
            codec.handshake_reply(&head, b"short"),
            Step::Incomplete
        ));
    }

    #[test]
    fn text_frame_roundtrip() {
        let encoded = encode_legacy_data(b"hello", FrameKind::String);
        assert_eq!(encoded.first(), Some(&0x00));
        assert_eq!(encoded.last(), Some(&0xFF));
        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = decode_legacy(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(
            decoded,
            Decoded::Data {
                payload: b"hello".to_vec(),
                kind: FrameKind::String
            }
        );
    }

    #[test]
    fn binary_frame_roundtrip_across_length_groups() {
        for size in [0_usize, 127, 128, 300] {
            let payload = vec![0x42_u8; size];
            let encoded = encode_legacy_data(&payload, FrameKind::Binary);
            let mut buf = BytesMut::from(&encoded[..]);
            let decoded = decode_legacy(&mut buf, 4096).unwrap().unwrap();
            let Decoded::Data { payload: got, kind } = decoded else {
                panic!("expected data frame");
            };
            assert_eq!(kind, FrameKind::Binary);
            assert_eq!(got.len(), size);
        }
    }

    #[test]
    fn partial_text_frame_suspends() {
        let mut buf = BytesMut::from(&[0x00, b'p', b'a', b'r'][..]);
        assert!(decode_legacy(&mut buf, 1024).unwrap().is_none());
        buf.extend_from_slice(&[b't', 0xFF]);
        let decoded = decode_legacy(&mut buf, 1024).unwrap().unwrap();
        assert!(matches!(decoded, Decoded::Data { .. }));
    }

    #[test]
    fn closing_handshake_is_surfaced() {
        let mut buf = BytesMut::from(&encode_legacy_close()[..]);
        assert_eq!(decode_legacy(&mut buf, 1024).unwrap().unwrap(), Decoded::Close);
    }

    #[test]
    fn overflowing_length_prefix_is_fatal() {
        // Ten 7-bit groups encode up to 70 bits; a prefix whose value
        // exceeds u64 must fail instead of aliasing to a smaller length.
        let mut frame = vec![0x80_u8];
        frame.extend_from_slice(&[0xFF; 9]);
        frame.push(0x7F);
        let mut buf = BytesMut::from(&frame[..]);
        assert!(matches!(
            decode_legacy(&mut buf, 1024),
            Err(GatewayError::Protocol(_))
        ));
    }

    #[test]
    fn unterminated_text_frame_over_limit_is_fatal() {
        let mut frame = vec![0x00_u8];
        frame.extend_from_slice(&vec![b'x'; 64]);
        let mut buf = BytesMut::from(&frame[..]);
        assert!(matches!(
            decode_legacy(&mut buf, 32),
            Err(GatewayError::PacketTooLarge { .. })
        ));
    }
}
