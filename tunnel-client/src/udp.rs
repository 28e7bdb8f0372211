//! Local UDP delivery (`spec.md` §4.3 "Local delivery (UDP)").
//!
//! Lazily opens one UDP socket to the local address on the first
//! `udp_data` envelope. Every inbound datagram is written to that
//! socket; a single reader task reads local→server and emits `udp_data`
//! envelopes with freshly minted stream ids. Best-effort: read errors are
//! logged and the loop continues, matching the spec's explicit
//! "no reliable demultiplex" note.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::warn;
use tunnel_protocol::message::Envelope;
use uuid::Uuid;

use crate::session::ClientSession;

/// Ensures the lazy local UDP socket is open, spawning the local→server
/// reader loop the first time. Returns the shared socket handle.
pub async fn ensure_socket(session: &Arc<ClientSession>) -> std::io::Result<Arc<UdpSocket>> {
    if let Some(existing) = session.udp_socket().await {
        return Ok(existing);
    }

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(&session.config.local_url).await?;
    let socket = Arc::new(socket);

    session.set_udp_socket(socket.clone()).await;

    let sess = session.clone();
    let reader_socket = socket.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader_socket.recv(&mut buf).await {
                Ok(n) => {
                    let stream_id = Uuid::new_v4().to_string();
                    let env = Envelope::UdpData {
                        stream_id,
                        data: buf[..n].to_vec(),
                    };
                    if sess.send(env).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("local udp read error (continuing): {e}");
                }
            }
        }
    });

    Ok(socket)
}
