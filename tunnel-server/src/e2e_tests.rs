//! End-to-end scenario coverage (`spec.md` §8 "Testable properties").
//!
//! Unlike the rest of the crate's tests, these drive a real `tunneld`
//! router over a real loopback socket against a real [`tunnel_client::ClientSession`],
//! exercising the full control-channel handshake and HTTP ingress path the
//! way the teacher's own `tests/` suite drives its agent/controller pair.
//! `tunneld` ships as a binary with no library target (matching the
//! teacher), so this lives as an in-crate module with direct access to
//! `AppState` and friends rather than as a separate `tests/e2e.rs`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::{TcpListener, TcpStream};
use tower_http::cors::CorsLayer;

use tunnel_client::config::ProtocolArg;
use tunnel_client::{ClientConfig, ClientSession};

use crate::auth::{HmacJwtValidator, StaticApiKeyValidator};
use crate::config::ServerConfig;
use crate::control;
use crate::ingress;
use crate::observability::NoopObserver;
use crate::ratelimit::TokenBucketRateLimiter;
use crate::registry::InMemoryTunnelRepository;
use crate::state::AppState;

const JWT_SECRET: &[u8] = b"e2e-test-secret";

async fn spawn_test_server() -> (SocketAddr, AppState) {
    let config = Arc::new(ServerConfig {
        http_addr: "127.0.0.1:0".into(),
        base_domain: "example.test".into(),
        localhost_domain: None,
        port_base: 0,
        port_range: 1,
        region: "test".into(),
        website_url: "https://example.test".into(),
        allowed_origins: vec![],
        jwt_secret: String::from_utf8(JWT_SECRET.to_vec()).unwrap(),
    });

    let state = AppState::new(
        config.clone(),
        InMemoryTunnelRepository::new(),
        Arc::new(TokenBucketRateLimiter::new()),
        Arc::new(HmacJwtValidator::new(JWT_SECRET.to_vec())),
        Arc::new(StaticApiKeyValidator::empty()),
        Arc::new(NoopObserver),
        Arc::new(NoopObserver),
    );

    let app = Router::new()
        .route("/ws", get(control::ws_handler))
        .fallback(ingress::http::dispatch)
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let listener = TcpListener::bind(&config.http_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (addr, state)
}

/// A tiny local HTTP service that answers every request with `200 ok`,
/// standing in for the service the client agent would normally tunnel to.
async fn spawn_echo_http() -> SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let body = b"ok";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

fn client_config(server_addr: SocketAddr, local_url: String, subdomain: &str, token: String) -> ClientConfig {
    ClientConfig {
        server_url: format!("ws://{server_addr}"),
        protocol: ProtocolArg::Http,
        local_url,
        token,
        subdomain: Some(subdomain.into()),
        host: None,
        force_new: false,
        no_resume: true,
    }
}

/// Polls until a live session is registered under `subdomain` and its
/// handler is ready, or panics after a short timeout.
async fn wait_for_session(state: &AppState, subdomain: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(session) = state.sessions.get(subdomain) {
            if session.is_handler_ready() {
                return;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("session for {subdomain} never became ready");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Issues a raw HTTP/1.1 request over loopback and returns `(status, body)`.
/// Written by hand rather than through `reqwest` so the `Host` header can be
/// set independently of the connect address, the way a virtual-host lookup
/// is actually exercised in production.
async fn raw_http_get(addr: SocketAddr, host_header: &str, path: &str) -> (u16, String) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host_header}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).into_owned();

    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
    (status, body)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_happy_path_relays_request_and_rewrites_nothing_plain_text() {
    let (server_addr, state) = spawn_test_server().await;
    let local_addr = spawn_echo_http().await;

    let token = HmacJwtValidator::sign(JWT_SECRET, "user-1");
    let config = client_config(server_addr, format!("http://{local_addr}"), "e2ehappy", token);
    let client = ClientSession::new(config);
    let _handle = tokio::spawn(client.run());

    wait_for_session(&state, "e2ehappy").await;

    let (status, body) = raw_http_get(server_addr, "e2ehappy.example.test", "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_refused_renders_bad_gateway_page() {
    let (server_addr, state) = spawn_test_server().await;

    // Bind, then immediately drop: the port is very likely still free, and
    // nothing is listening on it when the client tries to dial.
    let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    drop(dead_listener);

    let token = HmacJwtValidator::sign(JWT_SECRET, "user-1");
    let config = client_config(server_addr, format!("http://{dead_addr}"), "e2erefused", token);
    let client = ClientSession::new(config);
    let _handle = tokio::spawn(client.run());

    wait_for_session(&state, "e2erefused").await;

    let (status, body) = raw_http_get(server_addr, "e2erefused.example.test", "/").await;
    assert_eq!(status, 502);
    assert!(body.contains("Connection Refused"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_host_returns_not_found() {
    let (server_addr, _state) = spawn_test_server().await;

    let (status, body) = raw_http_get(server_addr, "nobody-home.example.test", "/").await;
    assert_eq!(status, 404);
    assert!(body.contains("No tunnel here"));
}
