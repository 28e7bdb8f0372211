//! Disconnect propagation (`spec.md` §4.4 "Disconnect propagation").
//!
//! A background loop polling every 2 s: if the external registry reports
//! a tunnel the server still holds a live session for as `inactive` (e.g.
//! disconnected from a dashboard), the session is sent a policy-violation
//! close frame, nilled, removed from the in-memory map, and its port (if
//! any) released. Ingress for such a tunnel then falls onto the
//! `endpoint_offline` path until a new `init` resurrects it.

use std::time::Duration;

use tracing::info;
use tunnel_protocol::{message::Envelope, ErrorKind, TunnelStatus};

use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub async fn run(state: AppState) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        sweep(&state).await;
    }
}

async fn sweep(state: &AppState) {
    for entry in state.sessions.iter() {
        let subdomain = entry.key().clone();
        let session = entry.value().clone();
        drop(entry);

        let identity = match state.registry.get_by_id(session.id).await {
            Some(identity) => identity,
            None => continue,
        };
        if identity.status != TunnelStatus::Inactive {
            continue;
        }

        let _ = session
            .send(Envelope::TunnelStatus {
                message: Some("disconnected by administrative action".into()),
            })
            .await;
        let _ = session
            .send(Envelope::InitError {
                error: ErrorKind::WriteClosed,
                message: "tunnel marked inactive".into(),
            })
            .await;
        session.close().await;

        state.sessions.remove(&subdomain);
        if let Some(port) = state.ports.port_for_tunnel(session.id) {
            state.ports.release(port);
        }
        info!(%subdomain, tunnel_id = %session.id, "propagated external disconnect");
    }
}
