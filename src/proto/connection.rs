//! Per-connection upgrade state machine.
//!
//! A [`Connection`] walks one client from raw bytes to a framed WebSocket
//! session: policy-sentinel check, request-line parse, header block,
//! handshake body, dialect handshake, then framed dispatch to its route.
//! It is sans-io — [`Connection::feed`] consumes a byte slice and returns
//! [`ConnEvent`]s for the owning socket task to act on — so every state
//! transition is reachable from a unit test without a socket.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::{Decoded, FrameCodec, FrameKind, Step, handshake};
use crate::error::GatewayError;
use crate::route::{FrameSink, Route, RouteCtx, RouteRegistry, UpgradeInfo};

/// Flash cross-domain policy probe, sent instead of an HTTP request.
const POLICY_SENTINEL: &[u8] = b"<policy-file-request/>\0";

/// Upper bound on the buffered request head before the client is rejected.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Canned response for malformed upgrade requests.
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n<html><head><title>400 Bad Request</title></head><body bgcolor=\"white\"><center><h1>400 Bad Request</h1></center></body></html>";

/// Parsed facts about the upgrade request.
///
/// Header names are stored lowercase; look them up lowercase.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method from the first line.
    pub method: String,
    /// Request path, always starting with `/`.
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    /// Protocol version token from the first line.
    pub version: String,
    /// Headers, names lowercased, last write wins.
    pub headers: HashMap<String, String>,
    /// Cookies parsed from the `Cookie` header.
    pub cookies: HashMap<String, String>,
    /// Client address.
    pub peer: SocketAddr,
    /// When the request started arriving.
    pub request_time: DateTime<Utc>,
}

impl RequestHead {
    /// Creates an empty head for a freshly accepted client.
    #[must_use]
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            method: String::new(),
            path: "/".to_string(),
            query: None,
            version: String::new(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            peer,
            request_time: Utc::now(),
        }
    }

    /// Looks up a header by its lowercase name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The `Host` header, falling back to the peer address.
    #[must_use]
    pub fn host(&self) -> String {
        self.header("host")
            .map_or_else(|| self.peer.to_string(), ToString::to_string)
    }

    /// Path plus query string, as the client sent it.
    #[must_use]
    pub fn request_uri(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{q}", self.path),
            None => self.path.clone(),
        }
    }

    /// First non-empty path segment; this names the route.
    #[must_use]
    pub fn route_segment(&self) -> Option<&str> {
        self.path.split('/').find(|s| !s.is_empty())
    }
}

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Nothing read yet; the policy sentinel is still possible.
    Root,
    /// Waiting for the request line.
    FirstLine,
    /// Reading the header block.
    Headers,
    /// Header block done; body bytes belong to the handshake.
    Content,
    /// Running the dialect handshake.
    Processing,
    /// Upgrade complete; decoding frames.
    Handshaked,
}

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Orderly close: peer close frame, EOF, or graceful shutdown.
    Normal,
    /// The request head could not be parsed.
    BadRequest,
    /// The upgrade was refused (no route, unsupported dialect, failed
    /// challenge, or the route declined the client).
    Rejected,
    /// The policy file was served; nothing else follows.
    PolicyServed,
    /// A wire-protocol violation after the handshake.
    ProtocolError,
}

/// Instruction for the socket task driving this connection.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnEvent {
    /// Write these bytes to the socket verbatim.
    Write(Vec<u8>),
    /// Serve the configured cross-domain policy file.
    PolicyRequest,
    /// Close the socket after flushing pending writes.
    Close(CloseKind),
}

/// One client connection's protocol state machine.
pub struct Connection {
    state: ConnState,
    buf: BytesMut,
    /// Handshake body bytes, staged separately so a suspended challenge
    /// does not consume frame bytes that arrive behind it.
    scratch: BytesMut,
    head: RequestHead,
    current_header: Option<String>,
    extensions: Vec<String>,
    codec: Option<FrameCodec>,
    route: Option<Box<dyn Route>>,
    registry: Arc<RouteRegistry>,
    max_allowed_packet: usize,
    policy_enabled: bool,
    shutdown_pending: bool,
    finished: bool,
    conn_id: u64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("state", &self.state)
            .field("peer", &self.head.peer)
            .field("dialect", &self.codec.as_ref().map(FrameCodec::dialect))
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a state machine for a freshly accepted client.
    #[must_use]
    pub fn new(
        peer: SocketAddr,
        registry: Arc<RouteRegistry>,
        max_allowed_packet: usize,
        policy_enabled: bool,
        conn_id: u64,
    ) -> Self {
        Self {
            state: ConnState::Root,
            buf: BytesMut::new(),
            scratch: BytesMut::new(),
            head: RequestHead::new(peer),
            current_header: None,
            extensions: Vec::new(),
            codec: None,
            route: None,
            registry,
            max_allowed_packet,
            policy_enabled,
            shutdown_pending: false,
            finished: false,
            conn_id,
        }
    }

    /// Side entry for an upgrade whose head an outer HTTP layer already
    /// parsed. Resumes at header post-processing on the next [`feed`].
    ///
    /// [`feed`]: Connection::feed
    #[must_use]
    pub fn from_inherited_request(
        head: RequestHead,
        registry: Arc<RouteRegistry>,
        max_allowed_packet: usize,
        conn_id: u64,
    ) -> Self {
        let mut conn = Self::new(head.peer, registry, max_allowed_packet, false, conn_id);
        conn.head = head;
        conn.state = ConnState::Headers;
        conn.buf.extend_from_slice(b"\r\n");
        conn
    }

    /// The parsed request head.
    #[must_use]
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Negotiated extension tokens, lowercased with any `x-webkit-`
    /// vendor prefix stripped.
    #[must_use]
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Whether the connection has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Feeds bytes from the socket through the state machine, returning
    /// the actions the socket task must take, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<ConnEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buf.extend_from_slice(data);

        loop {
            if self.finished {
                break;
            }
            match self.state {
                ConnState::Root => {
                    if self.policy_enabled {
                        let n = self.buf.len().min(POLICY_SENTINEL.len());
                        if self.buf.get(..n) == POLICY_SENTINEL.get(..n) {
                            if n < POLICY_SENTINEL.len() {
                                // Still ambiguous; wait for more bytes.
                                break;
                            }
                            debug!(conn = self.conn_id, peer = %self.head.peer, "policy file request");
                            events.push(ConnEvent::PolicyRequest);
                            self.finish(CloseKind::PolicyServed, &mut events);
                            continue;
                        }
                    }
                    self.state = ConnState::FirstLine;
                }
                ConnState::FirstLine => {
                    let Some(line) = self.take_line() else {
                        if self.buf.len() > MAX_HEAD_BYTES {
                            self.bad_request(&mut events);
                        }
                        break;
                    };
                    if line.is_empty() {
                        // Tolerate blank lines ahead of the request line.
                        continue;
                    }
                    if self.parse_request_line(&line) {
                        self.state = ConnState::Headers;
                    } else {
                        debug!(conn = self.conn_id, %line, "unparsable request line");
                        self.bad_request(&mut events);
                    }
                }
                ConnState::Headers => {
                    let Some(line) = self.take_line() else {
                        if self.buf.len() > MAX_HEAD_BYTES {
                            self.bad_request(&mut events);
                        }
                        break;
                    };
                    self.header_line(&line, &mut events);
                }
                ConnState::Content => {
                    self.state = ConnState::Processing;
                }
                ConnState::Processing => {
                    if !self.process_handshake(&mut events) {
                        break;
                    }
                }
                ConnState::Handshaked => {
                    if self.shutdown_pending && self.graceful_shutdown(&mut events) {
                        continue;
                    }
                    if let Some(kind) = self.pump_frames(&mut events) {
                        self.finish(kind, &mut events);
                    }
                    break;
                }
            }
        }
        events
    }

    /// The peer hung up. Finishes the connection if it has not already.
    pub fn on_eof(&mut self) -> Vec<ConnEvent> {
        let mut events = Vec::new();
        self.finish(CloseKind::Normal, &mut events);
        events
    }

    /// Asks the connection to close for a worker shutdown. Returns `true`
    /// when it finished; `false` defers until the route allows it.
    pub fn graceful_shutdown(&mut self, events: &mut Vec<ConnEvent>) -> bool {
        if self.finished {
            return true;
        }
        let ready = self
            .route
            .as_mut()
            .is_none_or(|route| route.graceful_shutdown());
        if ready {
            if self.state == ConnState::Handshaked
                && let Some(codec) = &self.codec
            {
                events.push(ConnEvent::Write(codec.encode_close()));
            }
            self.finish(CloseKind::Normal, events);
        } else {
            debug!(conn = self.conn_id, "route deferred graceful shutdown");
            self.shutdown_pending = true;
        }
        ready
    }

    /// Parses the request line. Returns `false` when it is malformed.
    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let (Some(method), Some(uri)) = (parts.next(), parts.next()) else {
            return false;
        };
        self.head.method = method.to_string();
        self.head.version = parts.next().unwrap_or("HTTP/1.1").to_string();

        // Absolute-form target: lift the authority into the Host header.
        let uri = if let Some(rest) = uri
            .strip_prefix("ws://")
            .or_else(|| uri.strip_prefix("wss://"))
            .or_else(|| uri.strip_prefix("http://"))
            .or_else(|| uri.strip_prefix("https://"))
        {
            match rest.find('/') {
                Some(pos) => {
                    let (host, path) = rest.split_at(pos);
                    self.head.headers.insert("host".to_string(), host.to_string());
                    path
                }
                None => {
                    self.head.headers.insert("host".to_string(), rest.to_string());
                    "/"
                }
            }
        } else {
            uri
        };

        if !uri.starts_with('/') {
            return false;
        }
        match uri.split_once('?') {
            Some((path, query)) => {
                self.head.path = path.to_string();
                self.head.query = Some(query.to_string());
            }
            None => {
                self.head.path = uri.to_string();
                self.head.query = None;
            }
        }
        true
    }

    /// Consumes one header-block line.
    fn header_line(&mut self, line: &str, events: &mut Vec<ConnEvent>) {
        if line.is_empty() {
            self.finish_headers(events);
            return;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Obsolete folding: the continuation joins the previous value.
            let Some(name) = self.current_header.clone() else {
                self.bad_request(events);
                return;
            };
            if let Some(value) = self.head.headers.get_mut(&name) {
                value.push_str(line);
            }
        } else if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            self.head.headers.insert(name.clone(), value.trim().to_string());
            self.current_header = Some(name);
        } else {
            debug!(conn = self.conn_id, %line, "malformed header line");
            self.bad_request(events);
        }
    }

    /// Header block complete: derive extensions and cookies, require the
    /// upgrade headers, and bind the frame codec.
    fn finish_headers(&mut self, events: &mut Vec<ConnEvent>) {
        self.current_header = None;

        if let Some(raw) = self.head.header("sec-websocket-extensions").map(ToString::to_string) {
            self.extensions = raw
                .split(',')
                .map(|token| {
                    let token = token.trim().to_ascii_lowercase();
                    token
                        .strip_prefix("x-webkit-")
                        .map_or(token.clone(), ToString::to_string)
                })
                .filter(|token| !token.is_empty())
                .collect();
        }

        if let Some(raw) = self.head.header("cookie").map(ToString::to_string) {
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.split_once('=') {
                    self.head
                        .cookies
                        .insert(name.trim().to_string(), value.trim().to_string());
                }
            }
        }

        let upgrade_requested = self
            .head
            .header("connection")
            .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
            && self
                .head
                .header("upgrade")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
        if !upgrade_requested {
            debug!(conn = self.conn_id, peer = %self.head.peer, "request is not a websocket upgrade");
            self.finish(CloseKind::Rejected, events);
            return;
        }

        match handshake::select_codec(&self.head, self.max_allowed_packet) {
            Ok(codec) => {
                debug!(
                    conn = self.conn_id,
                    dialect = codec.dialect(),
                    path = %self.head.path,
                    "dialect negotiated"
                );
                self.codec = Some(codec);
                self.state = ConnState::Content;
            }
            Err(err) => {
                warn!(conn = self.conn_id, %err, "upgrade refused");
                self.finish(CloseKind::Rejected, events);
            }
        }
    }

    /// Runs the dialect handshake. Returns `true` once the connection has
    /// moved to [`ConnState::Handshaked`].
    fn process_handshake(&mut self, events: &mut Vec<ConnEvent>) -> bool {
        // Everything after the header block belongs to the handshake until
        // the challenge has consumed its share.
        let body = self.buf.split();
        self.scratch.unsplit(body);

        if self.route.is_none() && !self.resolve_route(events) {
            return false;
        }

        let step = {
            let Self { codec, head, scratch, .. } = &mut *self;
            match codec.as_mut() {
                Some(codec) => codec.handshake_reply(head, scratch),
                None => Step::Rejected(GatewayError::Internal(
                    "handshake without a negotiated codec".to_string(),
                )),
            }
        };

        match step {
            Step::Incomplete => false,
            Step::Rejected(err) => {
                warn!(conn = self.conn_id, %err, "handshake failed");
                self.finish(CloseKind::Rejected, events);
                false
            }
            Step::Ready(reply) => {
                events.push(ConnEvent::Write(reply.response));
                self.scratch.advance(reply.consumed);
                if !self.codec.as_mut().is_some_and(FrameCodec::on_handshake) {
                    self.finish(CloseKind::ProtocolError, events);
                    return false;
                }
                // Leftover body bytes are the session's first frames.
                let rest = self.scratch.split();
                self.buf.unsplit(rest);
                self.state = ConnState::Handshaked;
                info!(
                    conn = self.conn_id,
                    peer = %self.head.peer,
                    dialect = self.codec.as_ref().map_or("?", FrameCodec::dialect),
                    path = %self.head.path,
                    "websocket session established"
                );

                let Self { codec, route, head, conn_id, .. } = &mut *self;
                if let (Some(codec), Some(route)) = (codec.as_ref(), route.as_mut()) {
                    let mut sink = WsSink { codec, out: events };
                    let mut ctx = RouteCtx::new(*conn_id, Some(head.peer), &mut sink);
                    route.on_handshake(&mut ctx);
                }
                true
            }
        }
    }

    /// Resolves and instantiates the route named by the request path.
    fn resolve_route(&mut self, events: &mut Vec<ConnEvent>) -> bool {
        let Some(name) = self.head.route_segment().map(ToString::to_string) else {
            warn!(conn = self.conn_id, path = %self.head.path, "upgrade without a route segment");
            self.finish(CloseKind::Rejected, events);
            return false;
        };
        let Some(provider) = self.registry.provider(&name) else {
            warn!(conn = self.conn_id, route = %name, "upgrade for unknown route");
            self.finish(CloseKind::Rejected, events);
            return false;
        };
        let info = UpgradeInfo {
            route: name.clone(),
            path: self.head.path.clone(),
            query: self.head.query.clone(),
            cookies: self.head.cookies.clone(),
            peer: Some(self.head.peer),
        };
        let Some(route) = provider.instantiate(&info) else {
            info!(conn = self.conn_id, route = %name, "route refused the client");
            self.finish(CloseKind::Rejected, events);
            return false;
        };
        self.route = Some(route);
        true
    }

    /// Decodes and dispatches buffered frames until the buffer holds at
    /// most a partial frame. Returns the close reason, if any.
    fn pump_frames(&mut self, events: &mut Vec<ConnEvent>) -> Option<CloseKind> {
        let Self { codec, route, buf, head, conn_id, .. } = &mut *self;
        let Some(codec) = codec.as_mut() else {
            return Some(CloseKind::ProtocolError);
        };
        loop {
            let decoded = match codec.decode(buf) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return None,
                Err(err) => {
                    warn!(conn = *conn_id, %err, "frame decode failed");
                    return Some(CloseKind::ProtocolError);
                }
            };
            match decoded {
                Decoded::Data { payload, kind } => {
                    let Some(handler) = route.as_mut() else {
                        return Some(CloseKind::ProtocolError);
                    };
                    let result = {
                        let mut sink = WsSink { codec, out: events };
                        let mut ctx = RouteCtx::new(*conn_id, Some(head.peer), &mut sink);
                        handler.on_frame(&mut ctx, &payload, kind)
                    };
                    if let Err(err) = result {
                        if handler.handle_exception(&err) {
                            debug!(conn = *conn_id, %err, "route claimed the error");
                        } else {
                            error!(conn = *conn_id, %err, "route error closed the connection");
                            return Some(CloseKind::ProtocolError);
                        }
                    }
                }
                Decoded::Ping(payload) => {
                    if let Some(pong) = codec.encode_pong(&payload) {
                        events.push(ConnEvent::Write(pong));
                    }
                }
                Decoded::Pong => {}
                Decoded::Close => {
                    events.push(ConnEvent::Write(codec.encode_close()));
                    return Some(CloseKind::Normal);
                }
            }
        }
    }

    /// Splits one CRLF-terminated line off the buffer.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let raw = self.buf.split_to(pos + 1);
        let mut line = String::from_utf8_lossy(&raw).into_owned();
        if line.ends_with('\n') {
            line.pop();
        }
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    /// Answers 400 and finishes.
    fn bad_request(&mut self, events: &mut Vec<ConnEvent>) {
        events.push(ConnEvent::Write(BAD_REQUEST.to_vec()));
        self.finish(CloseKind::BadRequest, events);
    }

    /// Finishes the connection exactly once: notifies the route, drops the
    /// codec, and tells the socket task to close.
    fn finish(&mut self, kind: CloseKind, events: &mut Vec<ConnEvent>) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(mut route) = self.route.take() {
            route.on_finish();
        }
        self.codec = None;
        debug!(conn = self.conn_id, peer = %self.head.peer, ?kind, "connection finished");
        events.push(ConnEvent::Close(kind));
    }
}

/// Frame sink over a live WebSocket connection: encodes with the bound
/// codec and queues the bytes as write events.
struct WsSink<'a> {
    codec: &'a FrameCodec,
    out: &'a mut Vec<ConnEvent>,
}

impl FrameSink for WsSink<'_> {
    fn send_frame(&mut self, payload: &[u8], kind: FrameKind) -> Result<(), GatewayError> {
        self.out
            .push(ConnEvent::Write(self.codec.encode_data(payload, kind)));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::route::echo::EchoRoute;
    use crate::route::RouteProvider;

    fn registry() -> Arc<RouteRegistry> {
        let mut registry = RouteRegistry::new();
        registry
            .register("echo", RouteProvider::Constructor(EchoRoute::boxed))
            .unwrap();
        Arc::new(registry)
    }

    fn conn(policy_enabled: bool) -> Connection {
        let peer: SocketAddr = "192.0.2.10:52000".parse().unwrap();
        Connection::new(peer, registry(), 1024 * 1024, policy_enabled, 7)
    }

    fn v13_request(path: &str) -> Vec<u8> {
        format!(
            "GET {path} HTTP/1.1\r\n\
             Host: gw.example\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             \r\n"
        )
        .into_bytes()
    }

    fn masked_text(payload: &[u8]) -> Vec<u8> {
        let key = [0x11_u8, 0x22, 0x33, 0x44];
        let mut out = vec![0x81, 0x80 | payload.len() as u8];
        out.extend_from_slice(&key);
        out.extend(payload.iter().zip(key.iter().cycle()).map(|(b, k)| b ^ k));
        out
    }

    fn first_write(events: &[ConnEvent]) -> &[u8] {
        for event in events {
            if let ConnEvent::Write(bytes) = event {
                return bytes;
            }
        }
        panic!("no write event in {events:?}");
    }

    #[test]
    fn v13_upgrade_completes() {
        let mut conn = conn(true);
        let events = conn.feed(&v13_request("/echo"));
        let reply = String::from_utf8_lossy(first_write(&events));
        assert!(reply.starts_with("HTTP/1.1 101 Switching Protocols"));
        assert!(reply.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(conn.state(), ConnState::Handshaked);
    }

    #[test]
    fn v13_frames_are_echoed() {
        let mut conn = conn(false);
        conn.feed(&v13_request("/echo"));
        let events = conn.feed(&masked_text(b"hello"));
        let mut expected = vec![0x81, 5];
        expected.extend_from_slice(b"hello");
        assert_eq!(events, vec![ConnEvent::Write(expected)]);
    }

    #[test]
    fn frames_behind_the_handshake_are_not_lost() {
        let mut conn = conn(false);
        let mut bytes = v13_request("/echo");
        bytes.extend_from_slice(&masked_text(b"early"));
        let events = conn.feed(&bytes);
        let mut expected = vec![0x81, 5];
        expected.extend_from_slice(b"early");
        assert!(events.contains(&ConnEvent::Write(expected)));
    }

    #[test]
    fn bad_request_line_gets_400() {
        let mut conn = conn(false);
        let events = conn.feed(b"NONSENSE\r\n");
        assert!(first_write(&events).starts_with(b"HTTP/1.1 400 Bad Request"));
        assert_eq!(events.last(), Some(&ConnEvent::Close(CloseKind::BadRequest)));
        assert!(conn.is_finished());
    }

    #[test]
    fn non_upgrade_request_closes_without_a_response() {
        let mut conn = conn(false);
        let events =
            conn.feed(b"GET /echo HTTP/1.1\r\nHost: gw.example\r\nConnection: close\r\n\r\n");
        assert_eq!(events, vec![ConnEvent::Close(CloseKind::Rejected)]);
    }

    #[test]
    fn unsupported_version_is_refused() {
        let mut conn = conn(false);
        let events = conn.feed(
            b"GET /echo HTTP/1.1\r\nHost: gw.example\r\nConnection: Upgrade\r\n\
              Upgrade: websocket\r\nSec-WebSocket-Version: 7\r\n\r\n",
        );
        assert_eq!(events, vec![ConnEvent::Close(CloseKind::Rejected)]);
    }

    #[test]
    fn unknown_route_is_refused() {
        let mut conn = conn(false);
        let events = conn.feed(&v13_request("/nope"));
        assert_eq!(events, vec![ConnEvent::Close(CloseKind::Rejected)]);
    }

    #[test]
    fn policy_sentinel_is_served() {
        let mut conn = conn(true);
        let events = conn.feed(b"<policy-file-request/>\0");
        assert_eq!(
            events,
            vec![
                ConnEvent::PolicyRequest,
                ConnEvent::Close(CloseKind::PolicyServed)
            ]
        );
    }

    #[test]
    fn policy_sentinel_split_across_reads() {
        let mut conn = conn(true);
        assert!(conn.feed(b"<policy-fi").is_empty());
        let events = conn.feed(b"le-request/>\0");
        assert_eq!(events.first(), Some(&ConnEvent::PolicyRequest));
    }

    #[test]
    fn policy_check_is_skipped_when_disabled() {
        let mut conn = conn(false);
        let events = conn.feed(b"<policy-file-request/>\0");
        // Treated as a garbage request line once the newline never comes;
        // nothing is emitted yet and nothing is served.
        assert!(!events.contains(&ConnEvent::PolicyRequest));
    }

    #[test]
    fn header_continuation_folds_into_previous_value() {
        let mut conn = conn(false);
        conn.feed(
            b"GET /echo HTTP/1.1\r\nHost: gw.example\r\nConnection: Upgrade\r\n\
              Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              X-Meta: alpha\r\n\tbeta\r\n\r\n",
        );
        assert_eq!(conn.head().header("x-meta"), Some("alpha\tbeta"));
    }

    #[test]
    fn webkit_extension_prefix_is_stripped() {
        let mut conn = conn(false);
        conn.feed(
            b"GET /echo HTTP/1.1\r\nHost: gw.example\r\nConnection: Upgrade\r\n\
              Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Extensions: X-Webkit-Deflate-Frame, Ping\r\n\r\n",
        );
        assert_eq!(conn.extensions(), ["deflate-frame", "ping"]);
    }

    #[test]
    fn absolute_uri_supplies_the_host() {
        let mut conn = conn(false);
        conn.feed(
            b"GET ws://gw.example/echo HTTP/1.1\r\nConnection: Upgrade\r\n\
              Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );
        assert_eq!(conn.head().header("host"), Some("gw.example"));
        assert_eq!(conn.head().path, "/echo");
        assert_eq!(conn.state(), ConnState::Handshaked);
    }

    #[test]
    fn inherited_request_resumes_at_header_processing() {
        let peer: SocketAddr = "192.0.2.10:52000".parse().unwrap();
        let mut head = RequestHead::new(peer);
        head.method = "GET".to_string();
        head.path = "/echo".to_string();
        head.headers
            .insert("host".to_string(), "gw.example".to_string());
        head.headers
            .insert("connection".to_string(), "Upgrade".to_string());
        head.headers
            .insert("upgrade".to_string(), "websocket".to_string());
        head.headers
            .insert("sec-websocket-version".to_string(), "13".to_string());
        head.headers.insert(
            "sec-websocket-key".to_string(),
            "dGhlIHNhbXBsZSBub25jZQ==".to_string(),
        );

        let mut conn = Connection::from_inherited_request(head, registry(), 1024 * 1024, 9);
        let events = conn.feed(b"");
        let reply = String::from_utf8_lossy(first_write(&events));
        assert!(reply.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(conn.state(), ConnState::Handshaked);
    }

    #[test]
    fn v0_handshake_waits_for_the_body_token() {
        let mut conn = conn(false);
        let events = conn.feed(
            b"GET /echo HTTP/1.1\r\nHost: example.com\r\nConnection: Upgrade\r\n\
              Upgrade: WebSocket\r\nOrigin: http://example.com\r\n\
              Sec-WebSocket-Key1: 18x 6]8vM;54 *(5:  {   U1]8  z [  8\r\n\
              Sec-WebSocket-Key2: 1_ tx7X d  <  nw  334J702) 7]o}` 0\r\n\r\n",
        );
        assert!(events.is_empty());
        assert_eq!(conn.state(), ConnState::Processing);

        assert!(conn.feed(b"Tm[K").is_empty());
        let events = conn.feed(b" T2u");
        let reply = first_write(&events);
        assert!(reply.starts_with(b"HTTP/1.1 101 WebSocket Protocol Handshake"));
        assert!(reply.ends_with(b"fQJ,fN/4F4!~K~MH"));
        assert_eq!(conn.state(), ConnState::Handshaked);
    }

    #[test]
    fn peer_close_is_acknowledged() {
        let mut conn = conn(false);
        conn.feed(&v13_request("/echo"));
        let close = vec![0x88, 0x80, 0x11, 0x22, 0x33, 0x44];
        let events = conn.feed(&close);
        assert_eq!(
            events,
            vec![
                ConnEvent::Write(vec![0x88, 0x02, 0x03, 0xE8]),
                ConnEvent::Close(CloseKind::Normal)
            ]
        );
    }

    #[test]
    fn eof_finishes_exactly_once() {
        let mut conn = conn(false);
        conn.feed(&v13_request("/echo"));
        assert_eq!(conn.on_eof(), vec![ConnEvent::Close(CloseKind::Normal)]);
        assert!(conn.on_eof().is_empty());
        assert!(conn.feed(b"ignored").is_empty());
    }

    #[test]
    fn graceful_shutdown_closes_a_handshaked_session() {
        let mut conn = conn(false);
        conn.feed(&v13_request("/echo"));
        let mut events = Vec::new();
        assert!(conn.graceful_shutdown(&mut events));
        assert_eq!(
            events,
            vec![
                ConnEvent::Write(vec![0x88, 0x02, 0x03, 0xE8]),
                ConnEvent::Close(CloseKind::Normal)
            ]
        );
    }

    #[test]
    fn graceful_shutdown_before_handshake_just_closes() {
        let mut conn = conn(false);
        let mut events = Vec::new();
        assert!(conn.graceful_shutdown(&mut events));
        assert_eq!(events, vec![ConnEvent::Close(CloseKind::Normal)]);
    }
}
