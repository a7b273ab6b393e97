//! COMET session bridge: a long-polling fallback transport.
//!
//! Clients without native WebSocket support initialize a [`Session`] bound
//! to a real route handler ("downstream"), then exchange the same message
//! stream over plain HTTP: `c2s` pushes a client frame to the downstream,
//! `poll` holds a request open until the downstream produces packets, and
//! `s2c` answers one held poll with buffered packets in FIFO order.
//!
//! Every operation after `init_session` authenticates with the composite
//! identifier `processId.sessionId.authKey`. An auth mismatch is dropped
//! silently so callers cannot enumerate session ids.

pub mod http;
pub mod payload;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::proto::FrameKind;
use crate::route::{FrameSink, Route, RouteCtx, RouteRegistry, UpgradeInfo};

/// How session auth keys are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPolicy {
    /// Hash of current time and client address, hex-encoded. Matches the
    /// historical behavior; not suitable for hostile networks.
    Weak,
    /// UUIDv4 from the process RNG.
    Strong,
}

impl FromStr for TokenPolicy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weak" => Ok(Self::Weak),
            "strong" => Ok(Self::Strong),
            other => Err(GatewayError::Internal(format!(
                "unknown token policy {other:?}"
            ))),
        }
    }
}

/// One buffered downstream-to-client message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Packet {
    /// Payload kind, `STRING` or `BINARY` on the wire.
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// Payload text; binary payloads are base64-encoded.
    pub data: String,
}

impl Packet {
    /// Builds a packet from a decoded frame.
    #[must_use]
    pub fn from_frame(payload: &[u8], kind: FrameKind) -> Self {
        let data = match kind {
            FrameKind::String => String::from_utf8_lossy(payload).into_owned(),
            FrameKind::Binary => base64::engine::general_purpose::STANDARD.encode(payload),
        };
        Self { kind, data }
    }
}

/// One held poll request awaiting packets.
struct PendingRequest {
    responder: oneshot::Sender<String>,
    jsid: Option<String>,
}

/// One bridge session: a downstream route handler plus its packet and
/// poll queues.
struct Session {
    id: u64,
    auth_key: String,
    route: Option<Box<dyn Route>>,
    packets: VecDeque<Packet>,
    /// Pending polls as `(worker_id, request_id)`, FIFO.
    polling: VecDeque<(u32, u64)>,
    peer: SocketAddr,
    /// Bumped on every re-arm so a stale timer task cannot tear the
    /// session down.
    timer_epoch: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    sessions: HashMap<u64, Session>,
    pending: HashMap<u64, PendingRequest>,
    next_session_id: u64,
    next_request_id: u64,
    process_id: u32,
}

impl Inner {
    /// Answers the oldest live pending poll of `session_id` with the whole
    /// buffered packet queue. Polls whose request has already been answered
    /// or expired are skipped; a poll is answered at most once.
    fn flush(&mut self, session_id: u64) {
        let Self { sessions, pending, process_id, .. } = self;
        let Some(session) = sessions.get_mut(&session_id) else {
            return;
        };
        if session.packets.is_empty() {
            return;
        }
        while let Some((worker_id, request_id)) = session.polling.pop_front() {
            if worker_id != *process_id {
                debug!(session = session_id, worker_id, "skipping poll owned by another worker");
                continue;
            }
            let Some(request) = pending.remove(&request_id) else {
                continue;
            };
            let packets: Vec<Packet> = session.packets.drain(..).collect();
            let body = payload::render(&packets, request.jsid.as_deref());
            if request.responder.send(body).is_err() {
                debug!(session = session_id, request_id, "polling client went away");
            }
            return;
        }
    }

    /// Removes the session, notifies its downstream, and answers all of
    /// its pending polls with an empty terminal body.
    fn teardown(&mut self, session_id: u64) {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return;
        };
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        if let Some(mut route) = session.route.take() {
            route.on_finish();
        }
        while let Some((_, request_id)) = session.polling.pop_front() {
            if let Some(request) = self.pending.remove(&request_id) {
                let body = payload::render(&[], request.jsid.as_deref());
                let _ = request.responder.send(body);
            }
        }
        debug!(session = session_id, "bridge session torn down");
    }
}

/// The bridge multiplexer shared by all HTTP handlers.
pub struct SessionBridge {
    inner: Arc<Mutex<Inner>>,
    registry: Arc<RouteRegistry>,
    idle_timeout: Duration,
    token_policy: TokenPolicy,
    process_id: u32,
}

impl fmt::Debug for SessionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBridge")
            .field("process_id", &self.process_id)
            .field("idle_timeout", &self.idle_timeout)
            .field("token_policy", &self.token_policy)
            .finish_non_exhaustive()
    }
}

impl SessionBridge {
    /// Creates a bridge over the given route registry.
    #[must_use]
    pub fn new(
        registry: Arc<RouteRegistry>,
        idle_timeout: Duration,
        token_policy: TokenPolicy,
    ) -> Self {
        let process_id = std::process::id();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sessions: HashMap::new(),
                pending: HashMap::new(),
                next_session_id: 0,
                next_request_id: 0,
                process_id,
            })),
            registry,
            idle_timeout,
            token_policy,
            process_id,
        }
    }

    /// This process's id, the first component of composite identifiers.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Creates a session bound to `route` and returns its composite
    /// identifier `processId.sessionId.authKey`.
    ///
    /// # Errors
    ///
    /// [`GatewayError::RouteNotFound`] when no such route is registered;
    /// [`GatewayError::RouteRejected`] when the route refuses the client.
    pub async fn init_session(
        &self,
        route_name: &str,
        peer: SocketAddr,
    ) -> Result<String, GatewayError> {
        let Some(provider) = self.registry.provider(route_name) else {
            warn!(route = route_name, "bridge init for unknown route");
            return Err(GatewayError::RouteNotFound(route_name.to_string()));
        };
        let info = UpgradeInfo::for_bridge(route_name, peer);
        let Some(route) = provider.instantiate(&info) else {
            return Err(GatewayError::RouteRejected(route_name.to_string()));
        };

        let auth_key = self.generate_auth_key(peer);
        let mut inner = self.inner.lock().await;
        inner.next_session_id += 1;
        let session_id = inner.next_session_id;
        inner.sessions.insert(
            session_id,
            Session {
                id: session_id,
                auth_key: auth_key.clone(),
                route: Some(route),
                packets: VecDeque::new(),
                polling: VecDeque::new(),
                peer,
                timer_epoch: 0,
                timer: None,
            },
        );

        if let Some(session) = inner.sessions.get_mut(&session_id) {
            let Session { id, route, packets, peer, .. } = session;
            if let Some(handler) = route.as_mut() {
                let mut sink = BridgeSink { packets };
                let mut ctx = RouteCtx::new(*id, Some(*peer), &mut sink);
                handler.on_handshake(&mut ctx);
            }
        }
        self.arm_idle_timer(&mut inner, session_id);

        info!(session = session_id, route = route_name, %peer, "bridge session opened");
        Ok(format!("{}.{session_id}.{auth_key}", self.process_id))
    }

    /// Forwards a client frame to the session's downstream as a STRING
    /// frame, then flushes and re-arms the idle timer.
    ///
    /// Silently dropped when the identifier does not authenticate or the
    /// session has no downstream.
    pub async fn c2s(&self, full_id: &str, body: &str) {
        let Some((session_id, auth_key)) = self.parse_full_id(full_id) else {
            return;
        };
        let mut inner = self.inner.lock().await;
        let mut failed = false;
        {
            let Some(session) = inner.sessions.get_mut(&session_id) else {
                return;
            };
            if session.auth_key != auth_key {
                return;
            }
            let Session { id, route, packets, peer, .. } = session;
            let Some(handler) = route.as_mut() else {
                return;
            };
            let result = {
                let mut sink = BridgeSink { packets };
                let mut ctx = RouteCtx::new(*id, Some(*peer), &mut sink);
                handler.on_frame(&mut ctx, body.as_bytes(), FrameKind::String)
            };
            if let Err(err) = result
                && !handler.handle_exception(&err)
            {
                warn!(session = session_id, %err, "downstream error closed the session");
                failed = true;
            }
        }
        if failed {
            inner.teardown(session_id);
            return;
        }
        inner.flush(session_id);
        self.arm_idle_timer(&mut inner, session_id);
    }

    /// Registers a poll HTTP request and returns its id plus the channel
    /// its response body will arrive on.
    pub async fn register_poll(&self, jsid: Option<String>) -> (u64, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        inner.next_request_id += 1;
        let request_id = inner.next_request_id;
        inner.pending.insert(request_id, PendingRequest { responder: tx, jsid });
        (request_id, rx)
    }

    /// Attaches a registered poll request to a session. Buffered packets
    /// answer it immediately; otherwise it stays queued until packets
    /// arrive, the session expires, or the caller gives up.
    ///
    /// Silently dropped when the identifier does not authenticate.
    pub async fn poll(&self, worker_id: u32, request_id: u64, full_id: &str) {
        let Some((session_id, auth_key)) = self.parse_full_id(full_id) else {
            return;
        };
        let mut inner = self.inner.lock().await;
        {
            let Some(session) = inner.sessions.get_mut(&session_id) else {
                return;
            };
            if session.auth_key != auth_key {
                return;
            }
            session.polling.push_back((worker_id, request_id));
        }
        inner.flush(session_id);
        self.arm_idle_timer(&mut inner, session_id);
    }

    /// Answers one held poll with the given packets. No-op when the
    /// request id is unknown (already answered or expired).
    pub async fn s2c(&self, request_id: u64, packets: Vec<Packet>) {
        let mut inner = self.inner.lock().await;
        let Some(request) = inner.pending.remove(&request_id) else {
            return;
        };
        let body = payload::render(&packets, request.jsid.as_deref());
        let _ = request.responder.send(body);
    }

    /// Withdraws a poll request whose hold deadline passed and returns the
    /// empty terminal body to answer it with.
    pub async fn expire_poll(&self, request_id: u64) -> String {
        let mut inner = self.inner.lock().await;
        let jsid = inner.pending.remove(&request_id).and_then(|r| r.jsid);
        payload::render(&[], jsid.as_deref())
    }

    /// Splits a composite identifier into `(sessionId, authKey)`.
    ///
    /// Accepts both the full `processId.sessionId.authKey` form and the
    /// short `sessionId.authKey` form; a foreign process id is dropped
    /// like any other authentication failure.
    fn parse_full_id(&self, full_id: &str) -> Option<(u64, String)> {
        let parts: Vec<&str> = full_id.splitn(3, '.').collect();
        let (session_id, auth_key) = match parts.as_slice() {
            [process, session_id, auth_key] => {
                if process.parse::<u32>().ok()? != self.process_id {
                    return None;
                }
                (session_id, auth_key)
            }
            [session_id, auth_key] => (session_id, auth_key),
            _ => return None,
        };
        let session_id: u64 = session_id.parse().ok()?;
        if auth_key.is_empty() {
            return None;
        }
        Some((session_id, (*auth_key).to_string()))
    }

    fn generate_auth_key(&self, peer: SocketAddr) -> String {
        match self.token_policy {
            TokenPolicy::Strong => Uuid::new_v4().simple().to_string(),
            TokenPolicy::Weak => {
                let mut hasher = std::hash::DefaultHasher::new();
                Utc::now()
                    .timestamp_nanos_opt()
                    .unwrap_or_default()
                    .hash(&mut hasher);
                peer.hash(&mut hasher);
                format!("{:x}", hasher.finish())
            }
        }
    }

    /// Re-arms the session's idle timer, invalidating any earlier one.
    fn arm_idle_timer(&self, inner: &mut Inner, session_id: u64) {
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return;
        };
        session.timer_epoch += 1;
        let epoch = session.timer_epoch;
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        let shared = Arc::clone(&self.inner);
        let idle = self.idle_timeout;
        session.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let mut inner = shared.lock().await;
            let expired = inner
                .sessions
                .get(&session_id)
                .is_some_and(|s| s.timer_epoch == epoch);
            if expired {
                debug!(session = session_id, "bridge session idle timeout");
                inner.teardown(session_id);
            }
        }));
    }
}

/// Frame sink over a bridge session: downstream frames become buffered
/// packets for polling clients.
struct BridgeSink<'a> {
    packets: &'a mut VecDeque<Packet>,
}

impl FrameSink for BridgeSink<'_> {
    fn send_frame(&mut self, payload: &[u8], kind: FrameKind) -> Result<(), GatewayError> {
        self.packets.push_back(Packet::from_frame(payload, kind));
        Ok(())
    }
}
