//! The client control-channel session (`spec.md` §4.3 "Client session").
//!
//! Owns the single control channel to the server: connect, init,
//! heartbeat, reconnect backoff, the HTTP request queue, and the local
//! dialers. Mirrors the teacher's `agent.rs` connection loop, generalized
//! from the teacher's controller/agent pairing protocol to the fabric's
//! `init`/`init_response` handshake and the four local-delivery paths of
//! `spec.md` §4.3.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use uuid::Uuid;

use tunnel_protocol::message::Envelope;
use tunnel_protocol::Protocol;

use crate::config::ClientConfig;
use crate::http::{self, NoopObserver, RequestObserver};
use crate::relay;
use crate::state::{self, ResumeState};
use crate::udp;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PONG_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const PONG_TIMEOUT: Duration = Duration::from_secs(40);
const READ_DEADLINE: Duration = Duration::from_secs(40);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;

/// The single long-lived control channel to the server, plus everything
/// needed to dial the local service per protocol.
pub struct ClientSession {
    pub config: ClientConfig,
    http_client: reqwest::Client,
    observer: Box<dyn RequestObserver>,

    write: Mutex<Option<WsSink>>,
    last_pong: Mutex<Instant>,
    reconnecting: Mutex<bool>,

    tcp_streams: RwLock<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
    udp_socket: Mutex<Option<Arc<UdpSocket>>>,
    pending_http: Mutex<VecDeque<Envelope>>,

    connected: AtomicBool,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            http_client: reqwest::Client::new(),
            observer: Box::new(NoopObserver),
            write: Mutex::new(None),
            last_pong: Mutex::new(Instant::now()),
            reconnecting: Mutex::new(false),
            tcp_streams: RwLock::new(HashMap::new()),
            udp_socket: Mutex::new(None),
            pending_http: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
        })
    }

    /// Runs the connect/init/heartbeat/reconnect loop forever. Never
    /// returns — each iteration is one connect attempt with exponential
    /// backoff between attempts, reset to the base delay by any
    /// successful connect (`spec.md` §4.3 "Reconnect").
    pub async fn run(self: Arc<Self>) {
        let mut backoff = RECONNECT_BASE;
        loop {
            match self.clone().connect_and_serve().await {
                Ok(()) => {
                    info!("control channel closed normally");
                }
                Err(e) => {
                    warn!("control channel error: {e}");
                }
            }
            // A successful connect (reflected by `connected` having been
            // set true at any point during the attempt, even if the
            // channel later dropped) cancels the backoff implicitly
            // (`spec.md` §4.3/§5 "Reconnect backoff is cancelled
            // implicitly by a successful connect").
            let had_connected = self.connected.swap(false, Ordering::SeqCst);
            *self.write.lock().await = None;
            if had_connected {
                backoff = RECONNECT_BASE;
            }

            info!("reconnecting in {:?}", backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }
    }

    async fn connect_and_serve(self: Arc<Self>) -> Result<(), String> {
        let ws_url = format!(
            "{}/ws",
            self.config.server_url.trim_end_matches('/')
        );
        let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| format!("connect failed: {e}"))?;
        info!("connected to {ws_url}");

        let (sink, mut stream) = ws_stream.split();
        *self.write.lock().await = Some(sink);
        *self.last_pong.lock().await = Instant::now();

        let resumed = if self.config.no_resume {
            None
        } else {
            state::load(&self.config.server_url, protocol_str(&self.config))
        };

        let init = build_init(&self.config, resumed.as_ref());
        self.send(init).await.map_err(|_| "write failed during init".to_string())?;

        let init_response = tokio::time::timeout(READ_DEADLINE, stream.next())
            .await
            .map_err(|_| "timed out waiting for init_response".to_string())?
            .ok_or_else(|| "control channel closed before init_response".to_string())?
            .map_err(|e| format!("read error: {e}"))?;

        let (tunnel_id, subdomain, public_url) = match parse_text(&init_response)
            .and_then(|t| serde_json::from_str::<Envelope>(&t).ok())
        {
            Some(Envelope::InitResponse {
                tunnel_id,
                subdomain,
                public_url,
                ..
            }) => (tunnel_id, subdomain, public_url),
            Some(Envelope::InitError { error, message }) => {
                return Err(format!("init rejected ({error:?}): {message}"));
            }
            _ => return Err("unexpected message in place of init_response".to_string()),
        };
        info!(subdomain, public_url, "tunnel registered");

        if !self.config.no_resume {
            let now = now();
            let resume_state = ResumeState {
                tunnel_id,
                subdomain,
                public_url,
                local_url: self.config.local_url.clone(),
                server_url: self.config.server_url.clone(),
                protocol: protocol_str(&self.config).to_string(),
                host: self.config.host.clone(),
                created_at: resumed.as_ref().map(|r| r.created_at).unwrap_or(now),
                last_used: now,
            };
            if let Err(e) = state::save(&resume_state) {
                warn!("failed to persist resume state: {e}");
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        self.drain_pending_http().await;

        let heartbeat_session = self.clone();
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if heartbeat_session.send(Envelope::Ping).await.is_err() {
                    return;
                }
            }
        });

        let checker_session = self.clone();
        let pong_checker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(PONG_CHECK_INTERVAL).await;
                let elapsed = checker_session.last_pong.lock().await.elapsed();
                if elapsed > PONG_TIMEOUT {
                    warn!("no pong for {:?}, forcing reconnect", elapsed);
                    checker_session.connected.store(false, Ordering::SeqCst);
                    return;
                }
            }
        });

        let result = self.read_loop(&mut stream).await;

        heartbeat.abort();
        pong_checker.abort();
        self.tcp_streams.write().await.clear();
        *self.udp_socket.lock().await = None;

        result
    }

    async fn read_loop(
        self: &Arc<Self>,
        stream: &mut futures::stream::SplitStream<WsStream>,
    ) -> Result<(), String> {
        loop {
            if !self.connected.load(Ordering::SeqCst) {
                return Err("pong timeout".to_string());
            }
            let msg = match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => return Err(format!("read error: {e}")),
                Ok(None) => return Ok(()),
                Err(_) => return Err("read deadline exceeded".to_string()),
            };

            let text = match parse_text(&msg) {
                Some(t) => t,
                None => continue,
            };
            let envelope: Envelope = match serde_json::from_str(&text) {
                Ok(e) => e,
                Err(e) => {
                    warn!("failed to parse envelope: {e}");
                    continue;
                }
            };

            self.dispatch(envelope).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Pong => {
                *self.last_pong.lock().await = Instant::now();
            }
            Envelope::Ping => {
                let _ = self.send(Envelope::Pong).await;
            }
            Envelope::HttpRequest { .. } => {
                let session = self.clone();
                tokio::spawn(async move {
                    session.handle_http_request(envelope).await;
                });
            }
            Envelope::TcpData { stream_id, data } => {
                self.handle_stream_data(Protocol::Tcp, stream_id, data).await;
            }
            Envelope::TlsData { stream_id, data } => {
                self.handle_stream_data(Protocol::Tls, stream_id, data).await;
            }
            Envelope::UdpData { stream_id: _, data } => {
                self.handle_udp_data(data).await;
            }
            Envelope::TcpError { stream_id, .. } | Envelope::TlsError { stream_id, .. } => {
                self.remove_stream(&stream_id).await;
            }
            Envelope::WsOpen { stream_id, path, query, headers } => {
                let session = self.clone();
                tokio::spawn(async move {
                    session.handle_ws_open(stream_id, path, query, headers).await;
                });
            }
            Envelope::TunnelStatus { message } => {
                info!(?message, "tunnel_status");
            }
            other => {
                warn!(kind = other.kind(), "unexpected envelope on client session");
            }
        }
    }

    async fn handle_http_request(self: Arc<Self>, envelope: Envelope) {
        let Envelope::HttpRequest {
            request_id,
            method,
            path,
            query,
            headers,
            body,
        } = envelope
        else {
            return;
        };

        if !self.connected.load(Ordering::SeqCst) {
            self.pending_http.lock().await.push_back(Envelope::HttpRequest {
                request_id,
                method,
                path,
                query,
                headers,
                body,
            });
            return;
        }

        let result = http::dial_http(
            &self.http_client,
            &self.config.local_url,
            &method,
            &path,
            &query,
            &headers,
            body,
            self.observer.as_ref(),
        )
        .await;

        let response_envelope = match result {
            Ok(r) => Envelope::HttpResponse {
                request_id,
                status: r.status,
                headers: r.headers,
                body: r.body,
            },
            Err(e) => {
                let (kind, message) = e.into_envelope_parts();
                Envelope::HttpError {
                    request_id,
                    error: kind,
                    message,
                }
            }
        };

        if self.send(response_envelope).await.is_err() {
            warn!("failed to send http response; session likely torn down");
        }
    }

    async fn handle_stream_data(self: &Arc<Self>, protocol: Protocol, stream_id: String, data: Vec<u8>) {
        let existing = self.tcp_streams.read().await.get(&stream_id).cloned();
        if let Some(tx) = existing {
            if !data.is_empty() {
                let _ = tx.send(data);
            }
            return;
        }

        // Empty payload on an unknown stream id means "open a new stream".
        match relay::open_stream(
            self.clone(),
            protocol,
            stream_id.clone(),
        )
        .await
        {
            Ok(tx) => {
                if !data.is_empty() {
                    let _ = tx.send(data);
                }
                self.tcp_streams.write().await.insert(stream_id, tx);
            }
            Err(e) => {
                error!(stream_id, "failed to dial local stream target: {e}");
                let err_env = if protocol == Protocol::Tls {
                    Envelope::TlsError {
                        stream_id,
                        error: tunnel_protocol::ErrorKind::ConnectionRefused,
                        message: e.to_string(),
                    }
                } else {
                    Envelope::TcpError {
                        stream_id,
                        error: tunnel_protocol::ErrorKind::ConnectionRefused,
                        message: e.to_string(),
                    }
                };
                let _ = self.send(err_env).await;
            }
        }
    }

    /// Dials the local service's own WebSocket endpoint for a `ws_open`
    /// (`spec.md` §4.5 passthrough): unlike `handle_stream_data`'s plain
    /// TCP connect, `local_url` is a full URL here (the HTTP-tunnel data
    /// model, `spec.md` §3), so the dial has to parse it and perform its
    /// own independent WebSocket client handshake against `path`/`query`
    /// rather than a bare TCP connect.
    async fn handle_ws_open(
        self: &Arc<Self>,
        stream_id: String,
        path: String,
        query: String,
        headers: tunnel_protocol::message::Headers,
    ) {
        match relay::open_ws_stream(self.clone(), stream_id.clone(), path, query, headers).await {
            Ok(tx) => {
                self.tcp_streams.write().await.insert(stream_id, tx);
            }
            Err(e) => {
                error!(stream_id, "failed to dial local websocket target: {e}");
                let _ = self
                    .send(Envelope::TcpError {
                        stream_id,
                        error: tunnel_protocol::ErrorKind::ConnectionRefused,
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    async fn handle_udp_data(self: &Arc<Self>, data: Vec<u8>) {
        match udp::ensure_socket(self).await {
            Ok(socket) => {
                if let Err(e) = socket.send(&data).await {
                    warn!("local udp write error: {e}");
                }
            }
            Err(e) => warn!("failed to open local udp socket: {e}"),
        }
    }

    pub async fn remove_stream(&self, stream_id: &str) {
        self.tcp_streams.write().await.remove(stream_id);
    }

    pub async fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp_socket.lock().await.clone()
    }

    pub async fn set_udp_socket(&self, socket: Arc<UdpSocket>) {
        *self.udp_socket.lock().await = Some(socket);
    }

    async fn drain_pending_http(self: &Arc<Self>) {
        let mut queued = Vec::new();
        {
            let mut pending = self.pending_http.lock().await;
            while let Some(env) = pending.pop_front() {
                queued.push(env);
            }
        }
        for env in queued {
            let session = self.clone();
            tokio::spawn(async move {
                session.handle_http_request(env).await;
            });
        }
    }

    /// Writes one envelope under the session-scoped write lock with a
    /// 10 s write deadline, clearing it afterward (`spec.md` §4.1 "Write
    /// discipline").
    pub async fn send(&self, envelope: Envelope) -> Result<(), ()> {
        let json = serde_json::to_string(&envelope).map_err(|_| ())?;
        let mut guard = self.write.lock().await;
        let sink = guard.as_mut().ok_or(())?;
        let result = tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(json.into())))
            .await
            .map_err(|_| ())?;
        result.map_err(|_| ())
    }
}

fn protocol_str(config: &ClientConfig) -> &'static str {
    Protocol::from(config.protocol).as_str()
}

fn build_init(config: &ClientConfig, resumed: Option<&ResumeState>) -> Envelope {
    let protocol: Protocol = config.protocol.into();
    Envelope::Init {
        version: 1,
        protocol,
        local_url: config.local_url.clone(),
        host: config.host.clone().or_else(|| resumed.and_then(|r| r.host.clone())),
        token: config.token.clone(),
        subdomain: config
            .subdomain
            .clone()
            .or_else(|| resumed.map(|r| r.subdomain.clone())),
        tunnel_id: resumed.map(|r| r.tunnel_id.clone()),
        force_new: config.force_new,
    }
}

fn parse_text(msg: &Message) -> Option<String> {
    match msg {
        Message::Text(t) => Some(t.to_string()),
        Message::Binary(b) => String::from_utf8(b.to_vec()).ok(),
        _ => None,
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolArg;

    fn test_config() -> ClientConfig {
        ClientConfig {
            server_url: "ws://127.0.0.1:7070".into(),
            protocol: ProtocolArg::Http,
            local_url: "http://127.0.0.1:9000".into(),
            token: "ur_test".into(),
            subdomain: None,
            host: None,
            force_new: false,
            no_resume: true,
        }
    }

    #[test]
    fn build_init_carries_resumed_identity_when_present() {
        let config = test_config();
        let resumed = ResumeState {
            tunnel_id: "t1".into(),
            subdomain: "foo".into(),
            public_url: "http://foo.example.test".into(),
            local_url: "http://127.0.0.1:9000".into(),
            server_url: "ws://127.0.0.1:7070".into(),
            protocol: "http".into(),
            host: None,
            created_at: 1,
            last_used: 2,
        };
        let init = build_init(&config, Some(&resumed));
        match init {
            Envelope::Init { subdomain, tunnel_id, .. } => {
                assert_eq!(subdomain.as_deref(), Some("foo"));
                assert_eq!(tunnel_id.as_deref(), Some("t1"));
            }
            _ => panic!("expected Init"),
        }
    }

    #[test]
    fn reconnect_backoff_doubles_until_cap() {
        let mut backoff = RECONNECT_BASE;
        let mut steps = vec![backoff];
        for _ in 0..6 {
            backoff = (backoff * 2).min(RECONNECT_CAP);
            steps.push(backoff);
        }
        assert_eq!(steps.last(), Some(&RECONNECT_CAP));
        assert!(steps.windows(2).all(|w| w[1] >= w[0]));
    }
}
