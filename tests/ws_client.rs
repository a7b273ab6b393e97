//! End-to-end tests against the raw WebSocket listener.

#![allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use comet_gateway::app_state::AppState;
use comet_gateway::bridge::TokenPolicy;
use comet_gateway::config::GatewayConfig;
use comet_gateway::route::echo::EchoRoute;
use comet_gateway::route::{RouteProvider, RouteRegistry};
use comet_gateway::server;

fn test_config() -> GatewayConfig {
    GatewayConfig {
        ws_listen_addr: "127.0.0.1:0".parse().unwrap(),
        http_listen_addr: "127.0.0.1:0".parse().unwrap(),
        max_allowed_packet: 1024 * 1024,
        session_idle_timeout_secs: 60,
        poll_hold_timeout_secs: 5,
        auth_token_policy: TokenPolicy::Strong,
        flash_policy_file: None,
    }
}

async fn start_gateway() -> (SocketAddr, watch::Sender<bool>) {
    let mut registry = RouteRegistry::new();
    registry
        .register("echo", RouteProvider::Constructor(EchoRoute::boxed))
        .unwrap();
    let state = AppState::new(test_config(), Arc::new(registry));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server::serve_ws(listener, state, shutdown_rx));
    (addr, shutdown_tx)
}

#[tokio::test]
async fn rfc6455_client_echo_roundtrip() {
    let (addr, _shutdown) = start_gateway().await;

    let (mut ws, response) = connect_async(format!("ws://{addr}/echo")).await.unwrap();
    assert_eq!(response.status().as_u16(), 101);

    ws.send(Message::Text("hello gateway".into()))
        .await
        .unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::Text("hello gateway".into()));

    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::Binary(vec![1, 2, 3].into()));

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn unknown_route_never_completes_the_handshake() {
    let (addr, _shutdown) = start_gateway().await;
    assert!(connect_async(format!("ws://{addr}/nope")).await.is_err());
}

#[tokio::test]
async fn hixie76_client_handshake_and_echo() {
    let (addr, _shutdown) = start_gateway().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Draft-76 sample challenge; the expected digest is a known vector.
    let request = "GET /echo HTTP/1.1\r\n\
                   Host: example.com\r\n\
                   Connection: Upgrade\r\n\
                   Upgrade: WebSocket\r\n\
                   Origin: http://example.com\r\n\
                   Sec-WebSocket-Key1: 18x 6]8vM;54 *(5:  {   U1]8  z [  8\r\n\
                   Sec-WebSocket-Key2: 1_ tx7X d  <  nw  334J702) 7]o}` 0\r\n\
                   \r\n";
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(b"Tm[K T2u").await.unwrap();

    let mut reply = Vec::new();
    while !reply.ends_with(b"fQJ,fN/4F4!~K~MH") {
        let mut chunk = [0_u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before handshake completed");
        reply.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 101 WebSocket Protocol Handshake"));

    // Legacy text frame: 0x00 <payload> 0xFF, echoed back unchanged.
    stream.write_all(&[0x00]).await.unwrap();
    stream.write_all(b"legacy hello").await.unwrap();
    stream.write_all(&[0xFF]).await.unwrap();

    let mut echo = Vec::new();
    while echo.last() != Some(&0xFF) {
        let mut chunk = [0_u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before echo arrived");
        echo.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(echo.first(), Some(&0x00));
    assert_eq!(&echo[1..echo.len() - 1], b"legacy hello");
}

#[tokio::test]
async fn policy_sentinel_is_answered_with_policy_xml() {
    let (addr, _shutdown) = start_gateway().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"<policy-file-request/>\0").await.unwrap();

    let mut reply = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&chunk[..n]);
        if reply.last() == Some(&0) {
            break;
        }
    }
    assert_eq!(reply.last(), Some(&0));
    let text = String::from_utf8_lossy(&reply);
    assert!(text.contains("<cross-domain-policy>"));
}

#[tokio::test]
async fn malformed_request_gets_400() {
    let (addr, _shutdown) = start_gateway().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"GARBAGE\r\n").await.unwrap();

    let mut reply = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&chunk[..n]);
    }
    assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request"));
}
