//! Ingress dispatchers (`spec.md` §4.5, §4.6).

pub mod http;
pub mod tcp;
pub mod udp;
