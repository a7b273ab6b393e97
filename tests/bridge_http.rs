//! End-to-end tests against the bridge HTTP API.

#![allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]

use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;

use comet_gateway::app_state::AppState;
use comet_gateway::bridge::TokenPolicy;
use comet_gateway::config::GatewayConfig;
use comet_gateway::route::echo::EchoRoute;
use comet_gateway::route::{RouteProvider, RouteRegistry};
use comet_gateway::server;

fn test_config(poll_hold_timeout_secs: u64) -> GatewayConfig {
    GatewayConfig {
        ws_listen_addr: "127.0.0.1:0".parse().unwrap(),
        http_listen_addr: "127.0.0.1:0".parse().unwrap(),
        max_allowed_packet: 1024 * 1024,
        session_idle_timeout_secs: 60,
        poll_hold_timeout_secs,
        auth_token_policy: TokenPolicy::Strong,
        flash_policy_file: None,
    }
}

async fn start_bridge(poll_hold_timeout_secs: u64) -> (String, watch::Sender<bool>) {
    let mut registry = RouteRegistry::new();
    registry
        .register("echo", RouteProvider::Constructor(EchoRoute::boxed))
        .unwrap();
    let state = AppState::new(test_config(poll_hold_timeout_secs), Arc::new(registry));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server::serve_http(listener, state, shutdown_rx));
    (format!("http://{addr}"), shutdown_tx)
}

#[tokio::test]
async fn init_c2s_poll_roundtrip() {
    let (base, _shutdown) = start_bridge(5).await;
    let client = reqwest::Client::new();

    let init: Value = client
        .post(format!("{base}/bridge/echo/init"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let full_id = init["id"].as_str().unwrap().to_string();
    assert_eq!(full_id.splitn(3, '.').count(), 3);

    let pushed = client
        .post(format!("{base}/bridge/c2s/{full_id}"))
        .body("ping")
        .send()
        .await
        .unwrap();
    assert!(pushed.status().is_success());

    let body = client
        .get(format!("{base}/bridge/poll/{full_id}"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("WebSocket.onmessage("));
    assert!(body.contains("\"data\":\"ping\""));
}

#[tokio::test]
async fn init_for_unknown_route_is_404() {
    let (base, _shutdown) = start_bridge(5).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/bridge/chat/init"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], 2001);
}

#[tokio::test]
async fn jsid_transport_batches_packets_in_order() {
    let (base, _shutdown) = start_bridge(5).await;
    let client = reqwest::Client::new();

    let init: Value = client
        .post(format!("{base}/bridge/echo/init"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let full_id = init["id"].as_str().unwrap().to_string();

    for payload in ["A", "B", "C"] {
        client
            .post(format!("{base}/bridge/c2s/{full_id}"))
            .body(payload)
            .send()
            .await
            .unwrap();
    }

    let body = client
        .get(format!("{base}/bridge/poll/{full_id}?js=7"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.starts_with("Response7 = "));
    let a = body.find("\"data\":\"A\"").unwrap();
    let b = body.find("\"data\":\"B\"").unwrap();
    let c = body.find("\"data\":\"C\"").unwrap();
    assert!(a < b && b < c);
}

#[tokio::test]
async fn forged_auth_key_poll_times_out_with_empty_body() {
    let (base, _shutdown) = start_bridge(1).await;
    let client = reqwest::Client::new();

    let init: Value = client
        .post(format!("{base}/bridge/echo/init"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let full_id = init["id"].as_str().unwrap().to_string();
    let mut parts = full_id.splitn(3, '.');
    let process = parts.next().unwrap();
    let session = parts.next().unwrap();
    let forged = format!("{process}.{session}.deadbeef");

    let body = client
        .get(format!("{base}/bridge/poll/{forged}"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    // Indistinguishable from an idle poll: empty terminal body.
    assert_eq!(body, "<script type=\"text/javascript\"></script>\n");
}

#[tokio::test]
async fn health_reports_session_count() {
    let (base, _shutdown) = start_bridge(5).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["sessions"], 0);

    client
        .post(format!("{base}/bridge/echo/init"))
        .send()
        .await
        .unwrap();

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["sessions"], 1);
}
