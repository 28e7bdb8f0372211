//! Per-tunnel stream registries for TCP/TLS/UDP (`spec.md` §3 "Stream",
//! §4.6).
//!
//! Each [`crate::session::TunnelSession`] owns one [`StreamRegistry`].
//! For TCP/TLS, a stream id maps to the sender half of a channel the
//! public-side pump task reads from — bytes arriving from the client over
//! the control channel are written to the public socket through it. For
//! UDP, a stream id maps to the remote address a reply datagram should be
//! sent back to (the "stream" is really just a demultiplexing tag for one
//! inbound packet, per `spec.md` §2 "each public datagram...").

use std::net::SocketAddr;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;

/// TCP/TLS byte-stream registry, keyed by stream id (a UUID string).
#[derive(Default)]
pub struct TcpStreamRegistry {
    channels: DashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
}

impl TcpStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stream_id: String, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.channels.insert(stream_id, tx);
    }

    pub fn forward(&self, stream_id: &str, data: Vec<u8>) -> bool {
        match self.channels.get(stream_id) {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, stream_id: &str) {
        self.channels.remove(stream_id);
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// UDP datagram registry, keyed by a per-packet stream id derived from
/// the remote address and a nanosecond timestamp (`spec.md` §3 "Stream
/// id (UUID for TCP/TLS; composite of remote-address + timestamp for
/// UDP)").
#[derive(Default)]
pub struct UdpStreamRegistry {
    entries: DashMap<String, (SocketAddr, Instant)>,
}

impl UdpStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, remote: SocketAddr) -> String {
        let stream_id = format!(
            "{remote}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        );
        self.entries.insert(stream_id.clone(), (remote, Instant::now()));
        stream_id
    }

    pub fn remote_for(&self, stream_id: &str) -> Option<SocketAddr> {
        self.entries.get(stream_id).map(|e| e.0)
    }

    /// Drops entries older than `max_age`, bounding unbounded growth for
    /// a tunnel that never sees a reply for some datagrams.
    pub fn sweep(&self, max_age: std::time::Duration) {
        self.entries.retain(|_, (_, created)| created.elapsed() < max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_registry_forwards_to_registered_stream_only() {
        let reg = TcpStreamRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.register("s1".into(), tx);
        assert!(reg.forward("s1", b"hi".to_vec()));
        assert!(!reg.forward("missing", b"hi".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), b"hi".to_vec());
    }

    #[test]
    fn udp_registry_round_trips_remote_address() {
        let reg = UdpStreamRegistry::new();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let id = reg.register(addr);
        assert_eq!(reg.remote_for(&id), Some(addr));
        assert_eq!(reg.remote_for("nonexistent"), None);
    }
}
