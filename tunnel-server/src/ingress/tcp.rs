//! Per-port TCP/TLS listener (`spec.md` §4.6, mirror image of §4.3's
//! client-side local delivery).
//!
//! The server never terminates TLS: for a `tls` tunnel this listener
//! pumps the exact same opaque bytes as a `tcp` tunnel, tagged
//! `tls_data`/`tls_error` instead of `tcp_data`/`tcp_error` so the client
//! knows to dial its local service with TLS rather than plain TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use tunnel_protocol::message::Envelope;
use tunnel_protocol::{ErrorKind, Protocol};

use crate::session::TunnelSession;
use crate::state::AppState;

const CHUNK_SIZE: usize = 4096;

/// Binds `port` and accepts connections for the lifetime of the tunnel.
/// Returns a handle the port allocator owns and aborts on release.
pub async fn spawn(
    state: AppState,
    session: Arc<TunnelSession>,
    protocol: Protocol,
    port: u16,
) -> JoinHandle<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(port, error = %e, "failed to bind tcp/tls listener");
            return tokio::spawn(async {});
        }
    };

    tokio::spawn(async move {
        loop {
            if !session.is_alive() {
                break;
            }
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(port, error = %e, "tcp accept failed");
                    continue;
                }
            };
            if !state.rate_limiter.check(session.id, session.per_minute, session.per_day) {
                drop(socket);
                continue;
            }
            handle_connection(session.clone(), protocol, socket, peer);
        }
    })
}

fn handle_connection(session: Arc<TunnelSession>, protocol: Protocol, socket: TcpStream, peer: SocketAddr) {
    let stream_id = Uuid::new_v4().to_string();
    let (mut read_half, mut write_half) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    session.tcp_streams.register(stream_id.clone(), tx);

    let open_session = session.clone();
    let open_stream_id = stream_id.clone();
    tokio::spawn(async move {
        let _ = open_session
            .send(make_data(protocol, open_stream_id, vec![]))
            .await;
    });

    // public → control channel
    let reader_session = session.clone();
    let reader_stream_id = stream_id.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let data = make_data(protocol, reader_stream_id.clone(), buf[..n].to_vec());
                    if reader_session.send(data).await.is_err() {
                        break;
                    }
                }
            }
        }
        let close = make_error(protocol, reader_stream_id.clone(), "connection_closed");
        let _ = reader_session.send(close).await;
        reader_session.tcp_streams.remove(&reader_stream_id);
        debug!(%peer, stream_id = %reader_stream_id, "tcp stream closed");
    });

    // control channel → public: drains the sender registered above
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if write_half.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });
}

fn make_data(protocol: Protocol, stream_id: String, data: Vec<u8>) -> Envelope {
    match protocol {
        Protocol::Tls => Envelope::TlsData { stream_id, data },
        _ => Envelope::TcpData { stream_id, data },
    }
}

fn make_error(protocol: Protocol, stream_id: String, message: &str) -> Envelope {
    match protocol {
        Protocol::Tls => Envelope::TlsError {
            stream_id,
            error: ErrorKind::Internal,
            message: message.into(),
        },
        _ => Envelope::TcpError {
            stream_id,
            error: ErrorKind::Internal,
            message: message.into(),
        },
    }
}
