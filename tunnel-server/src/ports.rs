//! Port allocator (`spec.md` §4.4 "Port allocation (TCP/TLS/UDP)").
//!
//! Linear scan of the configured range starting at a rolling cursor; each
//! candidate is probe-bound before a real per-port listener is spawned.
//! On resume, a tunnel id that already owns a port keeps it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use tunnel_protocol::Protocol;

use crate::config::ServerConfig;

struct Binding {
    tunnel_id: Uuid,
    listener: JoinHandle<()>,
}

pub struct PortAllocator {
    config: Arc<ServerConfig>,
    bindings: DashMap<u16, Binding>,
    cursor: AtomicU16,
}

impl PortAllocator {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let cursor = config.port_base;
        Self {
            config,
            bindings: DashMap::new(),
            cursor: AtomicU16::new(cursor),
        }
    }

    /// Returns the port already owned by `tunnel_id`, if any — used on
    /// resume so a reconnecting tunnel keeps its public port.
    pub fn port_for_tunnel(&self, tunnel_id: Uuid) -> Option<u16> {
        self.bindings
            .iter()
            .find(|entry| entry.value().tunnel_id == tunnel_id)
            .map(|entry| *entry.key())
    }

    /// Allocates a free port in the configured range and spawns the
    /// listener task produced by `make_listener`. Returns `None` if the
    /// range is exhausted.
    pub async fn allocate<F, Fut>(&self, tunnel_id: Uuid, make_listener: F) -> Option<u16>
    where
        F: FnOnce(u16) -> Fut,
        Fut: std::future::Future<Output = JoinHandle<()>>,
    {
        let base = self.config.port_base;
        let range = self.config.port_range.max(1);
        let start = self.cursor.load(Ordering::SeqCst);

        for offset in 0..range {
            let candidate = base.wrapping_add((start.wrapping_sub(base).wrapping_add(offset)) % range);
            if self.bindings.contains_key(&candidate) {
                continue;
            }
            if !probe_bind(candidate).await {
                continue;
            }
            let listener = make_listener(candidate).await;
            self.bindings.insert(
                candidate,
                Binding {
                    tunnel_id,
                    listener,
                },
            );
            self.cursor.store(candidate.wrapping_add(1), Ordering::SeqCst);
            info!(port = candidate, %tunnel_id, "allocated port");
            return Some(candidate);
        }
        warn!(%tunnel_id, "port range exhausted");
        None
    }

    /// Releases a port, aborting its listener task. Called when the
    /// owning session terminates without takeover.
    pub fn release(&self, port: u16) {
        if let Some((_, binding)) = self.bindings.remove(&port) {
            binding.listener.abort();
            info!(port, "released port");
        }
    }
}

/// Verifies a port is free with a best-effort probe bind on both TCP and
/// UDP (a TCP/TLS tunnel still wants the UDP half free and vice versa, so
/// the same numeric port is never double-booked across protocols).
async fn probe_bind(port: u16) -> bool {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let tcp_ok = tokio::net::TcpListener::bind(addr).await.is_ok();
    if !tcp_ok {
        return false;
    }
    tokio::net::UdpSocket::bind(addr).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            http_addr: "0.0.0.0:0".into(),
            base_domain: "example.test".into(),
            localhost_domain: None,
            port_base: 21000,
            port_range: 5,
            region: "local".into(),
            website_url: "https://example.test".into(),
            allowed_origins: vec![],
            jwt_secret: "secret".into(),
        })
    }

    #[tokio::test]
    async fn allocates_distinct_ports_for_distinct_tunnels() {
        let allocator = PortAllocator::new(test_config());
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();

        let p1 = allocator
            .allocate(id1, |port| async move { tokio::spawn(async move { let _ = port; }) })
            .await
            .expect("first allocation should succeed");
        let p2 = allocator
            .allocate(id2, |port| async move { tokio::spawn(async move { let _ = port; }) })
            .await
            .expect("second allocation should succeed");
        assert_ne!(p1, p2);

        assert_eq!(allocator.port_for_tunnel(id1), Some(p1));
        allocator.release(p1);
        assert_eq!(allocator.port_for_tunnel(id1), None);
    }

    #[tokio::test]
    async fn exhausted_range_returns_none_without_leaking() {
        let config = Arc::new(ServerConfig {
            port_base: 21100,
            port_range: 1,
            ..(*test_config()).clone()
        });
        let allocator = PortAllocator::new(config);
        let id1 = Uuid::new_v4();
        let _p1 = allocator
            .allocate(id1, |port| async move { tokio::spawn(async move { let _ = port; }) })
            .await
            .unwrap();

        let id2 = Uuid::new_v4();
        let p2 = allocator
            .allocate(id2, |port| async move { tokio::spawn(async move { let _ = port; }) })
            .await;
        assert!(p2.is_none());
    }
}
