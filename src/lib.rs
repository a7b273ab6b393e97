//! # comet-gateway
//!
//! A WebSocket termination gateway with a COMET long-polling fallback.
//!
//! The gateway speaks three historical WebSocket handshake dialects
//! (RFC 6455, Hixie-76, and the early key-less variant) on a raw TCP
//! listener, dispatching decoded frames to protocol-agnostic message
//! handlers ("routes"). Clients without native WebSocket support use the
//! session bridge instead: an HTTP surface that binds a session to the
//! same route contract and exchanges the message stream over long-polls.
//!
//! ## Architecture
//!
//! ```text
//! WebSocket clients ──> TCP listener (server/)
//!     │                      │
//!     │               Connection state machine (proto/connection)
//!     │                      │
//!     │               FrameCodec dialects (proto/v13, v0, ve)
//!     │                      │
//!     └───────────────> Route handlers (route/)
//!                            ▲
//! Polling clients ──> bridge HTTP surface (bridge/http)
//!                            │
//!                      SessionBridge (bridge/)
//! ```

pub mod app_state;
pub mod bridge;
pub mod config;
pub mod error;
pub mod proto;
pub mod route;
pub mod server;
