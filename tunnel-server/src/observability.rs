//! Statistics and request-log collectors (`spec.md` §1 "out of scope").
//!
//! The dashboards, REST replay endpoints, and the stores backing them are
//! explicitly excluded. Only the call sites and the interface the core
//! talks to are part of this crate; [`NoopObserver`] is the default
//! adapter so the rest of the server never has to special-case "nothing
//! is wired up".

use tunnel_protocol::Protocol;
use uuid::Uuid;

pub trait StatsSink: Send + Sync {
    fn record_request(&self, tunnel_id: Uuid, protocol: Protocol, status: u16, duration_ms: u64);
}

pub trait RequestLogSink: Send + Sync {
    fn log_http_request(&self, tunnel_id: Uuid, method: &str, path: &str, status: u16);
}

pub struct NoopObserver;

impl StatsSink for NoopObserver {
    fn record_request(&self, _tunnel_id: Uuid, _protocol: Protocol, _status: u16, _duration_ms: u64) {}
}

impl RequestLogSink for NoopObserver {
    fn log_http_request(&self, _tunnel_id: Uuid, _method: &str, _path: &str, _status: u16) {}
}
