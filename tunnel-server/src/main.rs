//! # Tunnel Relay Server
//!
//! A WebSocket-based relay server that exposes a locally running service
//! over a public HTTP/TCP/TLS/UDP endpoint. A client agent dials in over
//! the control channel ([`control`]) and the server fans inbound public
//! traffic back to it ([`ingress`]).
//!
//! ## Architecture
//!
//! ```text
//! Public client ──HTTP/TCP/TLS/UDP──► tunneld ──WS control channel──► tunnel client ──► local service
//! ```
//!
//! ## Modules
//!
//! - [`config`]        — CLI/environment configuration
//! - [`state`]          — shared application state
//! - [`control`]        — control-channel WebSocket lifecycle, resume/takeover
//! - [`resume`]         — identity resolution and session takeover
//! - [`ingress`]        — public-facing HTTP/TCP/TLS/UDP listeners
//! - [`registry`]       — tunnel identity store
//! - [`session`]        — live per-tunnel session state
//! - [`tracker`]        — HTTP request/response correlation
//! - [`ports`]          — TCP/TLS/UDP port allocation
//! - [`auth`]           — bearer/API-key validation
//! - [`ratelimit`]       — per-tunnel rate limiting
//! - [`disconnect`]     — external-disconnect propagation
//! - [`errors`]         — styled HTML error pages
//! - [`observability`]  — stats/request-log collector interfaces

mod auth;
mod config;
mod control;
mod disconnect;
mod errors;
mod ingress;
mod observability;
mod ports;
mod ratelimit;
mod registry;
mod resume;
mod session;
mod state;
mod tracker;
mod streams;

#[cfg(test)]
mod e2e_tests;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing::info;

use auth::{HmacJwtValidator, StaticApiKeyValidator};
use config::ServerConfig;
use observability::NoopObserver;
use ratelimit::TokenBucketRateLimiter;
use registry::InMemoryTunnelRepository;
use state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_server=info".into()),
        )
        .init();

    let config = Arc::new(ServerConfig::parse());

    let jwt_secret = config.jwt_secret.clone().into_bytes();
    let state = AppState::new(
        config.clone(),
        InMemoryTunnelRepository::new(),
        Arc::new(TokenBucketRateLimiter::new()),
        Arc::new(HmacJwtValidator::new(jwt_secret)),
        Arc::new(StaticApiKeyValidator::empty()),
        Arc::new(NoopObserver),
        Arc::new(NoopObserver),
    );

    tokio::spawn(disconnect::run(state.clone()));

    let cors = if config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    let app = Router::new()
        .route("/ws", get(control::ws_handler))
        .fallback(ingress::http::dispatch)
        .layer(cors)
        .with_state(state);

    let addr = config.http_addr.clone();
    info!("tunneld listening on {addr}, base domain {}", config.base_domain);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
