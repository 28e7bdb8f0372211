//! The shared error-kind vocabulary (`spec.md` §7).
//!
//! This is a closed set of *kinds*, not exception types — each value maps
//! to exactly one HTTP status and one styled error page on the server
//! side, and is carried verbatim as the `error` field of `*_error`
//! envelopes so the peer doesn't have to pattern-match on human text
//! (`spec.md` §9(c)).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("authentication required")]
    AuthRequired,
    #[error("authentication invalid")]
    AuthInvalid,
    #[error("validation failed")]
    Validation,
    #[error("subdomain unavailable")]
    SubdomainUnavailable,
    #[error("tunnel already active")]
    TunnelAlreadyActive,
    #[error("not found")]
    NotFound,
    #[error("endpoint offline")]
    EndpointOffline,
    #[error("protocol mismatch")]
    ProtocolMismatch,
    #[error("rate limited")]
    RateLimited,
    #[error("bad gateway")]
    BadGateway,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("timeout")]
    Timeout,
    #[error("write closed")]
    WriteClosed,
    #[error("internal error")]
    Internal,
}

impl ErrorKind {
    /// The HTTP status this kind maps to for HTTP ingress error pages.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::AuthRequired | ErrorKind::AuthInvalid => 401,
            ErrorKind::Validation => 400,
            ErrorKind::ProtocolMismatch => 400,
            ErrorKind::SubdomainUnavailable => 409,
            ErrorKind::TunnelAlreadyActive => 409,
            ErrorKind::NotFound => 404,
            ErrorKind::EndpointOffline => 503,
            ErrorKind::WriteClosed => 503,
            ErrorKind::RateLimited => 429,
            ErrorKind::ConnectionRefused => 502,
            ErrorKind::BadGateway => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_snake_case_tag() {
        let s = serde_json::to_string(&ErrorKind::ConnectionRefused).unwrap();
        assert_eq!(s, "\"connection_refused\"");
        let back: ErrorKind = serde_json::from_str(&s).unwrap();
        assert_eq!(back, ErrorKind::ConnectionRefused);
    }

    #[test]
    fn every_kind_maps_to_a_status() {
        for kind in [
            ErrorKind::AuthRequired,
            ErrorKind::AuthInvalid,
            ErrorKind::Validation,
            ErrorKind::SubdomainUnavailable,
            ErrorKind::TunnelAlreadyActive,
            ErrorKind::NotFound,
            ErrorKind::EndpointOffline,
            ErrorKind::ProtocolMismatch,
            ErrorKind::RateLimited,
            ErrorKind::BadGateway,
            ErrorKind::ConnectionRefused,
            ErrorKind::Timeout,
            ErrorKind::WriteClosed,
            ErrorKind::Internal,
        ] {
            assert!(kind.http_status() >= 400);
        }
    }
}
