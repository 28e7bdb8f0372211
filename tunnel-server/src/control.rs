//! Per-connection control-channel task (`spec.md` §4.4).
//!
//! Mirrors the teacher's `ws_handler`/`handle_connection` pair: one axum
//! `WebSocketUpgrade` route, one task per accepted connection. Unlike the
//! teacher's controller/agent pairing dance, the first frame on this
//! channel is always `init`, and everything past authentication is driven
//! by [`crate::resume`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tunnel_protocol::message::Envelope;
use tunnel_protocol::{ErrorKind, Protocol, TunnelStatus};

use crate::resume::{self, InitFields, Outcome};
use crate::session::TunnelSession;
use crate::state::AppState;

/// 3x the client's 30 s heartbeat, per `spec.md` §4.4 "Read deadlines".
const READ_DEADLINE: Duration = Duration::from_secs(90);
const HANDLER_READY_POLL: Duration = Duration::from_millis(50);
const HANDLER_READY_BUDGET: Duration = Duration::from_secs(1);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let init = match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        _ => {
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let envelope: Envelope = match serde_json::from_str(&init) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "malformed init frame");
            send_init_error(&mut sink, ErrorKind::Validation, "malformed init").await;
            return;
        }
    };

    let (protocol, local_url, host, token, subdomain, tunnel_id, force_new) = match envelope {
        Envelope::Init {
            protocol,
            local_url,
            host,
            token,
            subdomain,
            tunnel_id,
            force_new,
            ..
        } => (protocol, local_url, host, token, subdomain, tunnel_id, force_new),
        other => {
            debug!(kind = other.kind(), "expected init as the first frame");
            send_init_error(&mut sink, ErrorKind::Validation, "expected init").await;
            return;
        }
    };

    if local_url.trim().is_empty() {
        send_init_error(&mut sink, ErrorKind::Validation, "local_url is required").await;
        return;
    }

    let auth = match resume::authenticate(&state, &token).await {
        Ok(auth) => auth,
        Err(kind) => {
            send_init_error(&mut sink, kind, "authentication failed").await;
            return;
        }
    };

    let fields = InitFields {
        protocol,
        local_url: local_url.clone(),
        host: host.clone(),
        subdomain,
        tunnel_id,
        force_new,
    };

    let (identity, outcome) = match resume::resolve_identity(&state, &fields, &auth.user_id).await {
        Ok(pair) => pair,
        Err(kind) => {
            send_init_error(&mut sink, kind, "identity resolution failed").await;
            return;
        }
    };

    if outcome == Outcome::Resumed {
        state
            .registry
            .update_local_url(identity.id, local_url.clone())
            .await;
    }
    state
        .registry
        .update_status(identity.id, TunnelStatus::Active)
        .await;
    state
        .registry
        .associate_with_user(identity.id, auth.user_id.clone())
        .await;

    let session = Arc::new(TunnelSession::new(
        identity.id,
        identity.subdomain.clone(),
        identity.protocol,
        auth.user_id.clone(),
        local_url,
        sink,
        auth.per_minute,
        auth.per_day,
    ));

    if resume::register_session(&state, session.clone()) {
        info!(subdomain = %identity.subdomain, tunnel_id = %identity.id, "takeover: replaced a previously live session");
    }

    if let Err(kind) = ensure_port(&state, &session, &identity).await {
        let _ = session
            .send(Envelope::InitError {
                error: kind,
                message: "port allocation failed".into(),
            })
            .await;
        state.sessions.remove(&identity.subdomain);
        return;
    }

    let public_port = state
        .registry
        .get_by_id(identity.id)
        .await
        .and_then(|t| t.public_port);
    let public_url = build_public_url(&state, &identity.subdomain, identity.protocol, public_port);

    let reader_session = session.clone();
    let reader_state = state.clone();
    let reader_subdomain = identity.subdomain.clone();
    let reader_task = tokio::spawn(async move {
        read_loop(reader_state, reader_session, reader_subdomain, stream).await;
    });

    let deadline = Instant::now() + HANDLER_READY_BUDGET;
    while !session.is_handler_ready() && Instant::now() < deadline {
        tokio::time::sleep(HANDLER_READY_POLL).await;
    }

    let init_response = Envelope::InitResponse {
        tunnel_id: identity.id.to_string(),
        subdomain: identity.subdomain.clone(),
        public_url,
        status: "active".into(),
        region: Some(state.config.region.clone()),
    };
    let _ = session.send(init_response).await;

    let _ = reader_task.await;
}

/// Allocates (or reuses, on resume) a public port for non-HTTP protocols.
/// HTTP tunnels are routed by virtual host and never touch the port map.
async fn ensure_port(
    state: &AppState,
    session: &Arc<TunnelSession>,
    identity: &tunnel_protocol::TunnelIdentity,
) -> Result<(), ErrorKind> {
    if identity.protocol.is_http() {
        return Ok(());
    }
    if let Some(port) = state.ports.port_for_tunnel(identity.id) {
        state.registry.set_public_port(identity.id, Some(port)).await;
        return Ok(());
    }

    let state_for_listener = state.clone();
    let session_for_listener = session.clone();
    let protocol = identity.protocol;
    let port = state
        .ports
        .allocate(identity.id, move |port| {
            spawn_listener(state_for_listener, session_for_listener, protocol, port)
        })
        .await;

    match port {
        Some(port) => {
            state.registry.set_public_port(identity.id, Some(port)).await;
            Ok(())
        }
        None => {
            warn!(tunnel_id = %identity.id, "no ports available in configured range");
            Err(ErrorKind::Internal)
        }
    }
}

async fn spawn_listener(
    state: AppState,
    session: Arc<TunnelSession>,
    protocol: Protocol,
    port: u16,
) -> tokio::task::JoinHandle<()> {
    match protocol {
        Protocol::Udp => crate::ingress::udp::spawn(state, session, port).await,
        _ => crate::ingress::tcp::spawn(state, session, protocol, port).await,
    }
}

fn build_public_url(state: &AppState, subdomain: &str, protocol: Protocol, port: Option<u16>) -> String {
    let domain = state.config.domain_for_public_url();
    match protocol {
        Protocol::Http => format!("http://{subdomain}.{domain}"),
        _ => match port {
            Some(port) => format!("{domain}:{port}"),
            None => domain.to_string(),
        },
    }
}

/// The reader half of the control channel: marks `handler_ready`,
/// re-verifies registration, then dispatches every incoming envelope
/// until the peer disconnects or this session is superseded.
async fn read_loop(
    state: AppState,
    session: Arc<TunnelSession>,
    subdomain: String,
    mut stream: SplitStream<WebSocket>,
) {
    session.handler_ready.store(true, Ordering::SeqCst);
    match state.sessions.get(&subdomain) {
        Some(current) if Arc::ptr_eq(&*current, &session) => {}
        _ => {
            debug!(%subdomain, "reader exiting before first read: session already replaced");
            return;
        }
    }

    loop {
        if !session.is_alive() {
            debug!(%subdomain, "reader exiting: session superseded");
            return;
        }

        let next = tokio::time::timeout(READ_DEADLINE, stream.next()).await;
        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                warn!(%subdomain, error = %e, "control channel read error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                // Only tear down if our handle is still the live one;
                // otherwise we were silently superseded (`spec.md` §4.4).
                if session.is_alive() {
                    warn!(%subdomain, "control channel read timed out");
                }
                break;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => dispatch(&state, &session, envelope).await,
                Err(e) => debug!(%subdomain, error = %e, "ignoring malformed envelope"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    teardown(&state, &session, &subdomain).await;
}

async fn dispatch(state: &AppState, session: &Arc<TunnelSession>, envelope: Envelope) {
    match envelope {
        Envelope::Ping => {
            let _ = session.send(Envelope::Pong).await;
            // A ping does not advance the aggregate request counter
            // (`spec.md` §9 open question (a)).
            state.registry.update_activity(session.id, 0).await;
        }
        Envelope::Pong => {
            state.registry.update_activity(session.id, 0).await;
        }
        Envelope::HttpResponse {
            request_id,
            status,
            headers,
            body,
        } => {
            if let Ok(id) = Uuid::parse_str(&request_id) {
                let _ = state.tracker.complete(
                    id,
                    crate::tracker::HttpResponse {
                        status,
                        headers,
                        body,
                    },
                );
            }
        }
        Envelope::HttpError {
            request_id,
            error,
            message,
        } => {
            if let Ok(id) = Uuid::parse_str(&request_id) {
                let _ = state.tracker.fail(id, error, message);
            }
        }
        Envelope::TcpData { stream_id, data } | Envelope::TlsData { stream_id, data } => {
            if data.is_empty() {
                debug!(stream_id, "peer acknowledged stream open");
            } else if !session.tcp_streams.forward(&stream_id, data) {
                debug!(stream_id, "no local pump registered for stream; dropping");
            }
        }
        Envelope::TcpError { stream_id, .. } | Envelope::TlsError { stream_id, .. } => {
            session.tcp_streams.remove(&stream_id);
        }
        Envelope::UdpData { stream_id, data } => {
            if let Some(remote) = session.udp_streams.remote_for(&stream_id) {
                crate::ingress::udp::reply(session, remote, data).await;
            }
        }
        Envelope::UdpError { .. } => {}
        Envelope::TunnelStatus { .. }
        | Envelope::Init { .. }
        | Envelope::InitResponse { .. }
        | Envelope::InitError { .. }
        | Envelope::WsOpen { .. } => {
            debug!(kind = envelope.kind(), "unexpected envelope on an established session");
        }
    }
}

/// Releases everything this session owns, but only if it hasn't already
/// been superseded by a takeover (which nils `alive` and schedules its
/// own close independently).
async fn teardown(state: &AppState, session: &Arc<TunnelSession>, subdomain: &str) {
    session.alive.store(false, Ordering::SeqCst);

    let still_current = state
        .sessions
        .get(subdomain)
        .map(|s| Arc::ptr_eq(&*s, session))
        .unwrap_or(false);
    if !still_current {
        return;
    }

    state.sessions.remove(subdomain);
    if let Some(port) = state.ports.port_for_tunnel(session.id) {
        state.ports.release(port);
    }
    info!(%subdomain, tunnel_id = %session.id, "session disconnected");
}

async fn send_init_error(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    error: ErrorKind,
    message: &str,
) {
    let envelope = Envelope::InitError {
        error,
        message: message.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&envelope) {
        let _ = sink.send(Message::Text(json.into())).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}
