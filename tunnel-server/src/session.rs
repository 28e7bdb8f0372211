//! The in-memory `TunnelSession` (`spec.md` §3 "TunnelSession", §4.1
//! "Write discipline").
//!
//! Bound to one control channel. Owns the write side under a
//! session-scoped mutex (write discipline per `spec.md` §4.1); any task
//! may read the session through the registry but must check `alive`
//! before writing, since a takeover replaces the map entry but a stale
//! reference to the old session may still be held by an in-flight
//! ingress request.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use tunnel_protocol::message::Envelope;
use tunnel_protocol::Protocol;

use crate::streams::{TcpStreamRegistry, UdpStreamRegistry};

const WRITE_DEADLINE: Duration = Duration::from_secs(10);

pub struct TunnelSession {
    pub id: Uuid,
    pub subdomain: String,
    pub protocol: Protocol,
    pub owner_user_id: String,
    pub local_url: RwLock<String>,

    write: Mutex<SplitSink<WebSocket, Message>>,

    /// Set once the reader task has been scheduled and has re-verified
    /// registration (`spec.md` §4.4 "Handler-ready handshake").
    pub handler_ready: AtomicBool,
    /// Cleared the moment this session is superseded by a takeover or
    /// torn down, so any task still holding an `Arc` to it knows to stop
    /// writing and exit silently.
    pub alive: AtomicBool,
    pub request_count: AtomicU64,

    /// Rate-limit quota resolved at `init` time (`spec.md` §6 "Auth
    /// validators"); zero means unmetered. Checked per-accept (TCP/UDP)
    /// or per-request (HTTP) by the ingress dispatchers.
    pub per_minute: u32,
    pub per_day: u32,

    pub tcp_streams: TcpStreamRegistry,
    pub udp_streams: UdpStreamRegistry,
    udp_socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl TunnelSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        subdomain: String,
        protocol: Protocol,
        owner_user_id: String,
        local_url: String,
        sink: SplitSink<WebSocket, Message>,
        per_minute: u32,
        per_day: u32,
    ) -> Self {
        Self {
            id,
            subdomain,
            protocol,
            owner_user_id,
            local_url: RwLock::new(local_url),
            write: Mutex::new(sink),
            handler_ready: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            request_count: AtomicU64::new(0),
            per_minute,
            per_day,
            tcp_streams: TcpStreamRegistry::new(),
            udp_streams: UdpStreamRegistry::new(),
            udp_socket: Mutex::new(None),
        }
    }

    /// Stores the bound UDP socket for this tunnel so replies received on
    /// the control channel (`udp_data` from the client) can be written
    /// back to the originating public-side remote address.
    pub async fn set_udp_socket(&self, socket: Arc<UdpSocket>) {
        *self.udp_socket.lock().await = Some(socket);
    }

    pub async fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp_socket.lock().await.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_handler_ready(&self) -> bool {
        self.handler_ready.load(Ordering::SeqCst)
    }

    /// Writes one envelope under the write lock with a 10 s deadline. A
    /// failed write marks the session dead and the caller should treat it
    /// as a teardown trigger (`spec.md` §4.1).
    pub async fn send(&self, envelope: Envelope) -> Result<(), ()> {
        if !self.is_alive() {
            return Err(());
        }
        let json = serde_json::to_string(&envelope).map_err(|_| ())?;
        let mut sink = self.write.lock().await;
        let result = tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(json.into())))
            .await
            .map_err(|_| ())?;
        match result {
            Ok(()) => Ok(()),
            Err(_) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(())
            }
        }
    }

    /// Sends a close frame and marks the session dead; used both for
    /// ordinary teardown and for the takeover "nil the old handle, close
    /// after a short delay" sequence (`spec.md` §4.4).
    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut sink = self.write.lock().await;
        let _ = tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Close(None))).await;
    }
}

/// Nils the handle (marks it dead so no further writes are attempted)
/// immediately, then closes the underlying socket after a short delay so
/// the superseded session's reader task observes the nulled handle and
/// exits silently rather than racing the new session (`spec.md` §4.4).
pub fn schedule_close_after_takeover(session: std::sync::Arc<TunnelSession>) {
    session.alive.store(false, Ordering::SeqCst);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close().await;
    });
}
