//! Shared server state (`spec.md` §9 "Global mutable state").
//!
//! The only process-wide state: the tunnel registry's in-memory session
//! map, the port map, and the request tracker, encapsulated here and
//! handed to every handler by reference — generalizing the teacher's
//! `AppState` (agents/connections/sessions `DashMap`s) to the fabric's
//! subdomain-keyed session registry plus its external-interface adapters.

use std::sync::Arc;

use dashmap::DashMap;

use crate::auth::{ApiKeyValidator, JwtValidator};
use crate::config::ServerConfig;
use crate::observability::{RequestLogSink, StatsSink};
use crate::ports::PortAllocator;
use crate::ratelimit::RateLimiter;
use crate::registry::TunnelRepository;
use crate::session::TunnelSession;
use crate::tracker::RequestTracker;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<dyn TunnelRepository>,
    /// Live sessions keyed by subdomain. Per `spec.md` §3's invariant, at
    /// most one session exists per subdomain at any instant.
    pub sessions: Arc<DashMap<String, Arc<TunnelSession>>>,
    pub tracker: Arc<RequestTracker>,
    pub ports: Arc<PortAllocator>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub jwt: Arc<dyn JwtValidator>,
    pub api_keys: Arc<dyn ApiKeyValidator>,
    pub stats: Arc<dyn StatsSink>,
    pub request_log: Arc<dyn RequestLogSink>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<dyn TunnelRepository>,
        rate_limiter: Arc<dyn RateLimiter>,
        jwt: Arc<dyn JwtValidator>,
        api_keys: Arc<dyn ApiKeyValidator>,
        stats: Arc<dyn StatsSink>,
        request_log: Arc<dyn RequestLogSink>,
    ) -> Self {
        Self {
            ports: Arc::new(PortAllocator::new(config.clone())),
            config,
            registry,
            sessions: Arc::new(DashMap::new()),
            tracker: Arc::new(RequestTracker::new()),
            rate_limiter,
            jwt,
            api_keys,
            stats,
            request_log,
        }
    }

    /// Looks up a live session by subdomain, falling back to a
    /// custom-domain lookup via the registry (`spec.md` §4.5).
    pub async fn find_session_by_host(&self, host: &str) -> Option<Arc<TunnelSession>> {
        if let Some(session) = self.sessions.get(host) {
            return Some(session.clone());
        }
        let identity = self.registry.get_by_custom_domain(host).await?;
        self.sessions.get(&identity.subdomain).map(|s| s.clone())
    }
}
