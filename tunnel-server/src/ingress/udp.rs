//! Per-port UDP listener (`spec.md` §4.6).
//!
//! One socket per UDP tunnel. Each inbound datagram gets a fresh
//! per-packet stream id (`spec.md` §3 "Stream id"); replies carried back
//! over the control channel are matched to their originating remote
//! address via `session.udp_streams` and written back out on the same
//! socket (`spec.md` §2 "Data flow (UDP)").

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::warn;

use tunnel_protocol::message::Envelope;

use crate::session::TunnelSession;
use crate::state::AppState;

const MAX_DATAGRAM: usize = 64 * 1024;
const STREAM_MAX_AGE: Duration = Duration::from_secs(60);

pub async fn spawn(state: AppState, session: Arc<TunnelSession>, port: u16) -> JoinHandle<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = match UdpSocket::bind(addr).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            warn!(port, error = %e, "failed to bind udp listener");
            return tokio::spawn(async {});
        }
    };
    session.set_udp_socket(socket.clone()).await;

    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut since_sweep = tokio::time::Instant::now();
        loop {
            if !session.is_alive() {
                break;
            }
            let (n, remote) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(port, error = %e, "udp recv failed");
                    continue;
                }
            };
            if !state.rate_limiter.check(session.id, session.per_minute, session.per_day) {
                continue;
            }
            let stream_id = session.udp_streams.register(remote);
            let envelope = Envelope::UdpData {
                stream_id,
                data: buf[..n].to_vec(),
            };
            if session.send(envelope).await.is_err() {
                break;
            }
            if since_sweep.elapsed() > STREAM_MAX_AGE {
                session.udp_streams.sweep(STREAM_MAX_AGE);
                since_sweep = tokio::time::Instant::now();
            }
        }
    })
}

/// Sends a reply datagram back to the public-side remote address that
/// originated `stream_id`; called from `crate::control::dispatch` when a
/// `udp_data` envelope arrives from the client.
pub async fn reply(session: &Arc<TunnelSession>, remote: SocketAddr, data: Vec<u8>) {
    if let Some(socket) = session.udp_socket().await {
        if let Err(e) = socket.send_to(&data, remote).await {
            warn!(%remote, error = %e, "udp reply send failed");
        }
    }
}
