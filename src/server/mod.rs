//! Listeners: the raw TCP WebSocket listener and the bridge HTTP server.
//!
//! The WebSocket side deliberately bypasses axum: historical dialects need
//! raw socket access (the Hixie-76 body token and the legacy framing are
//! not expressible through an HTTP-upgrade abstraction). Each accepted
//! socket gets its own task that pumps bytes through the sans-io
//! [`Connection`] machine and acts on the events it returns.

pub mod policy;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, error, info, info_span};

use crate::app_state::AppState;
use crate::bridge;
use crate::proto::connection::{ConnEvent, Connection};
use policy::PolicyFile;

static CONN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Runs the raw WebSocket listener until the shutdown signal fires.
///
/// # Errors
///
/// Returns the underlying I/O error when binding or accepting fails, or
/// when the configured policy file cannot be read.
pub async fn run_ws_listener(state: AppState, shutdown: watch::Receiver<bool>) -> io::Result<()> {
    let listener = TcpListener::bind(state.config.ws_listen_addr).await?;
    serve_ws(listener, state, shutdown).await
}

/// Serves WebSocket clients on an already-bound listener.
///
/// # Errors
///
/// Returns the underlying I/O error when accepting fails or the configured
/// policy file cannot be read.
pub async fn serve_ws(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let policy = Arc::new(PolicyFile::load(state.config.flash_policy_file.as_deref())?);
    info!(addr = ?listener.local_addr(), "websocket listener ready");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("websocket listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let conn_id = CONN_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(conn = conn_id, %peer, "connection accepted");
                let span = info_span!("ws_conn", conn = conn_id, %peer);
                tokio::spawn(
                    drive_connection(
                        stream,
                        peer,
                        state.clone(),
                        Arc::clone(&policy),
                        conn_id,
                        shutdown.clone(),
                    )
                    .instrument(span),
                );
            }
        }
    }
}

/// Pumps one socket through its [`Connection`] state machine.
async fn drive_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
    policy: Arc<PolicyFile>,
    conn_id: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut conn = Connection::new(
        peer,
        Arc::clone(&state.registry),
        state.config.max_allowed_packet,
        true,
        conn_id,
    );
    let mut buf = vec![0_u8; 8192];

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let mut events = Vec::new();
                conn.graceful_shutdown(&mut events);
                match apply_events(&mut stream, &policy, events).await {
                    Ok(false) if !conn.is_finished() => {
                        // Route deferred; keep serving until it agrees.
                    }
                    _ => return,
                }
            }
            read = stream.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        let events = conn.on_eof();
                        let _ = apply_events(&mut stream, &policy, events).await;
                        return;
                    }
                    Ok(n) => {
                        let Some(chunk) = buf.get(..n) else {
                            return;
                        };
                        let events = conn.feed(chunk);
                        match apply_events(&mut stream, &policy, events).await {
                            Ok(false) => {}
                            Ok(true) => return,
                            Err(err) => {
                                debug!(conn = conn_id, %err, "write failed");
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        debug!(conn = conn_id, %err, "read failed");
                        let _ = apply_events(&mut stream, &policy, conn.on_eof()).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Acts on connection events in order. Returns `Ok(true)` once the socket
/// has been closed.
async fn apply_events(
    stream: &mut TcpStream,
    policy: &PolicyFile,
    events: Vec<ConnEvent>,
) -> io::Result<bool> {
    for event in events {
        match event {
            ConnEvent::Write(bytes) => stream.write_all(&bytes).await?,
            ConnEvent::PolicyRequest => stream.write_all(&policy.response()).await?,
            ConnEvent::Close(kind) => {
                debug!(?kind, "closing socket");
                let _ = stream.shutdown().await;
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Runs the bridge HTTP server until the shutdown signal fires.
///
/// # Errors
///
/// Returns the underlying I/O error when binding or serving fails.
pub async fn run_http_server(state: AppState, shutdown: watch::Receiver<bool>) -> io::Result<()> {
    let listener = TcpListener::bind(state.config.http_listen_addr).await?;
    serve_http(listener, state, shutdown).await
}

/// Serves the bridge HTTP API on an already-bound listener.
///
/// # Errors
///
/// Returns the underlying I/O error when serving fails.
pub async fn serve_http(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let app = bridge::http::build_router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    info!(addr = ?listener.local_addr(), "bridge http server ready");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
        info!("bridge http server shutting down");
    });

    if let Err(err) = serve.await {
        error!(%err, "bridge http server failed");
        return Err(err);
    }
    Ok(())
}
