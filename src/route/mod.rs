//! Route contract and registry.
//!
//! A route is a protocol-agnostic message handler bound to exactly one
//! endpoint — a real WebSocket connection or a bridge session — for its
//! lifetime. Handlers never see wire framing: they receive decoded
//! `(payload, kind)` frames and send replies through a [`FrameSink`],
//! so the same handler serves native and polling clients unchanged.

pub mod echo;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::proto::FrameKind;

/// Handshake-time facts a route factory may inspect before accepting a
/// client.
#[derive(Debug, Clone)]
pub struct UpgradeInfo {
    /// Route name (first path segment).
    pub route: String,
    /// Full request path.
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    /// Parsed request cookies.
    pub cookies: HashMap<String, String>,
    /// Client address, when known.
    pub peer: Option<SocketAddr>,
}

impl UpgradeInfo {
    /// Builds the minimal info the bridge has for a polling client.
    #[must_use]
    pub fn for_bridge(route: &str, peer: SocketAddr) -> Self {
        Self {
            route: route.to_string(),
            path: format!("/{route}"),
            query: None,
            cookies: HashMap::new(),
            peer: Some(peer),
        }
    }
}

/// Outbound frame sink a route sends through.
///
/// Implemented by the WebSocket connection (encodes and writes) and by the
/// bridge session (buffers packets for polling clients).
pub trait FrameSink {
    /// Sends one frame toward the client.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint can no longer accept frames.
    fn send_frame(&mut self, payload: &[u8], kind: FrameKind) -> Result<(), GatewayError>;
}

/// Dispatch context handed to route hooks.
///
/// Carries the endpoint identity for logging plus the outbound sink.
/// This replaces any process-global "current connection" marker: the
/// context travels with the call.
pub struct RouteCtx<'a> {
    /// Endpoint identifier (connection id or bridge session id).
    pub endpoint: u64,
    /// Client address, when known.
    pub peer: Option<SocketAddr>,
    sink: &'a mut dyn FrameSink,
}

impl<'a> RouteCtx<'a> {
    /// Creates a context over the given sink.
    pub fn new(endpoint: u64, peer: Option<SocketAddr>, sink: &'a mut dyn FrameSink) -> Self {
        Self {
            endpoint,
            peer,
            sink,
        }
    }

    /// Sends one frame toward this endpoint's client.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint can no longer accept frames.
    pub fn send_frame(&mut self, payload: &[u8], kind: FrameKind) -> Result<(), GatewayError> {
        self.sink.send_frame(payload, kind)
    }
}

impl fmt::Debug for RouteCtx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteCtx")
            .field("endpoint", &self.endpoint)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// A message handler bound to one endpoint.
pub trait Route: Send {
    /// Called once after the handshake reply has been written.
    fn on_handshake(&mut self, _ctx: &mut RouteCtx<'_>) {}

    /// Called for every decoded inbound frame, in arrival order.
    ///
    /// # Errors
    ///
    /// An error is first offered to [`Route::handle_exception`]; if the
    /// route does not claim it, the endpoint is torn down.
    fn on_frame(
        &mut self,
        ctx: &mut RouteCtx<'_>,
        payload: &[u8],
        kind: FrameKind,
    ) -> Result<(), GatewayError>;

    /// Called exactly once when the endpoint finishes.
    fn on_finish(&mut self) {}

    /// Whether the endpoint may be closed for a graceful worker shutdown.
    fn graceful_shutdown(&mut self) -> bool {
        true
    }

    /// Offered errors raised by [`Route::on_frame`]. Returning `true`
    /// claims the error and keeps the endpoint alive.
    fn handle_exception(&mut self, _err: &GatewayError) -> bool {
        false
    }
}

/// How a registered route produces handler instances.
///
/// A closed set resolved at registration time — there is no runtime
/// class probing; an unregistered name simply has no provider.
pub enum RouteProvider {
    /// Plain constructor; one handler per handshake.
    Constructor(fn() -> Box<dyn Route>),
    /// Factory closure that may inspect the upgrade and refuse the client
    /// by returning `None`.
    Factory(Arc<dyn Fn(&UpgradeInfo) -> Option<Box<dyn Route>> + Send + Sync>),
}

impl RouteProvider {
    /// Produces a handler for this upgrade, or `None` when refused.
    #[must_use]
    pub fn instantiate(&self, info: &UpgradeInfo) -> Option<Box<dyn Route>> {
        match self {
            Self::Constructor(ctor) => Some(ctor()),
            Self::Factory(factory) => factory(info),
        }
    }
}

impl fmt::Debug for RouteProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constructor(_) => f.write_str("RouteProvider::Constructor"),
            Self::Factory(_) => f.write_str("RouteProvider::Factory"),
        }
    }
}

/// Immutable path-segment → provider mapping.
///
/// Populated during startup and shared read-only afterwards, so lookups
/// from the connection state machine need no locking.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: HashMap<String, RouteProvider>,
}

impl RouteRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under a path segment.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] on a duplicate name; route names
    /// are validated once at load time.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        provider: RouteProvider,
    ) -> Result<(), GatewayError> {
        let name = name.into();
        if self.routes.contains_key(&name) {
            return Err(GatewayError::Internal(format!(
                "route {name} registered twice"
            )));
        }
        self.routes.insert(name, provider);
        Ok(())
    }

    /// Looks up the provider for a path segment.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&RouteProvider> {
        self.routes.get(name)
    }

    /// Whether a route is registered under this name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
