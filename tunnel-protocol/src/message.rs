//! The control-channel message envelope (`spec.md` §4.1, §6).
//!
//! One self-describing JSON record per frame, tagged the same way the
//! teacher's `WsMessage` is tagged (`#[serde(tag = "type", rename_all =
//! "snake_case")]`) so each variant serializes to `{"type": "...", ...}`.
//! Binary payloads (HTTP bodies, TCP/TLS/UDP chunks) are carried as
//! base64 text so the whole envelope stays one JSON text frame, matching
//! how the teacher's `Data { payload: String }` already base64-encodes
//! relayed TCP bytes.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::identity::Protocol;

/// Single-valued header map: at most one value per header name, as
/// `spec.md` §6 requires for `http_request`/`http_response`.
pub type Headers = BTreeMap<String, String>;

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        BASE64
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// All possible control-channel messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    // ── Init / resume handshake ──────────────────────────────────
    Init {
        version: u32,
        protocol: Protocol,
        local_url: String,
        #[serde(default)]
        host: Option<String>,
        token: String,
        #[serde(default)]
        subdomain: Option<String>,
        #[serde(default)]
        tunnel_id: Option<String>,
        #[serde(default)]
        force_new: bool,
    },
    InitResponse {
        tunnel_id: String,
        subdomain: String,
        public_url: String,
        status: String,
        #[serde(default)]
        region: Option<String>,
    },
    InitError {
        error: ErrorKind,
        message: String,
    },

    // ── Heartbeat ─────────────────────────────────────────────────
    Ping,
    Pong,

    // ── HTTP request/response correlation ────────────────────────
    HttpRequest {
        request_id: String,
        method: String,
        path: String,
        query: String,
        headers: Headers,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },
    HttpResponse {
        request_id: String,
        status: u16,
        headers: Headers,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },
    HttpError {
        request_id: String,
        error: ErrorKind,
        message: String,
    },

    // ── TCP byte stream ───────────────────────────────────────────
    TcpData {
        stream_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    TcpError {
        stream_id: String,
        error: ErrorKind,
        message: String,
    },

    // ── TLS byte stream (server never terminates TLS; same shape as TCP) ──
    TlsData {
        stream_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    TlsError {
        stream_id: String,
        error: ErrorKind,
        message: String,
    },

    // ── UDP datagrams ─────────────────────────────────────────────
    UdpData {
        stream_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    UdpError {
        stream_id: String,
        error: ErrorKind,
        message: String,
    },

    // ── WebSocket-upgrade passthrough (`spec.md` §4.5) ────────────
    /// Opens a byte-relayed stream that the client must dial as a real
    /// WebSocket client handshake against `local_url + path ± query`,
    /// rather than the bare TCP connect an ordinary `tcp_data`/`tls_data`
    /// open implies. Once the client's local handshake completes, the
    /// stream is relayed as plain `tcp_data`/`tcp_error` like any other
    /// byte stream.
    WsOpen {
        stream_id: String,
        path: String,
        query: String,
        headers: Headers,
    },

    // ── Informational ─────────────────────────────────────────────
    TunnelStatus {
        #[serde(default)]
        message: Option<String>,
    },
}

impl Envelope {
    /// A short tag name for logging, matching each JSON `"type"` value.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Init { .. } => "init",
            Envelope::InitResponse { .. } => "init_response",
            Envelope::InitError { .. } => "init_error",
            Envelope::Ping => "ping",
            Envelope::Pong => "pong",
            Envelope::HttpRequest { .. } => "http_request",
            Envelope::HttpResponse { .. } => "http_response",
            Envelope::HttpError { .. } => "http_error",
            Envelope::TcpData { .. } => "tcp_data",
            Envelope::TcpError { .. } => "tcp_error",
            Envelope::TlsData { .. } => "tls_data",
            Envelope::TlsError { .. } => "tls_error",
            Envelope::UdpData { .. } => "udp_data",
            Envelope::UdpError { .. } => "udp_error",
            Envelope::WsOpen { .. } => "ws_open",
            Envelope::TunnelStatus { .. } => "tunnel_status",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(e: Envelope) {
        let json = serde_json::to_string(&e).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(
            serde_json::to_string(&back).unwrap(),
            json,
            "roundtrip mismatch for {json}"
        );
    }

    #[test]
    fn roundtrips_every_tag() {
        roundtrip(Envelope::Init {
            version: 1,
            protocol: Protocol::Http,
            local_url: "http://127.0.0.1:9000".into(),
            host: None,
            token: "ur_abc".into(),
            subdomain: Some("foo".into()),
            tunnel_id: None,
            force_new: false,
        });
        roundtrip(Envelope::InitResponse {
            tunnel_id: "t1".into(),
            subdomain: "foo".into(),
            public_url: "http://foo.example.test".into(),
            status: "active".into(),
            region: Some("us-east".into()),
        });
        roundtrip(Envelope::Ping);
        roundtrip(Envelope::Pong);
        roundtrip(Envelope::HttpRequest {
            request_id: "r1".into(),
            method: "GET".into(),
            path: "/".into(),
            query: "".into(),
            headers: Headers::new(),
            body: vec![1, 2, 3],
        });
        roundtrip(Envelope::HttpResponse {
            request_id: "r1".into(),
            status: 200,
            headers: Headers::new(),
            body: b"ok".to_vec(),
        });
        roundtrip(Envelope::HttpError {
            request_id: "r1".into(),
            error: ErrorKind::ConnectionRefused,
            message: "dial refused".into(),
        });
        roundtrip(Envelope::TcpData {
            stream_id: "s1".into(),
            data: vec![],
        });
        roundtrip(Envelope::TcpError {
            stream_id: "s1".into(),
            error: ErrorKind::Internal,
            message: "closed".into(),
        });
        roundtrip(Envelope::TlsData {
            stream_id: "s1".into(),
            data: vec![9, 9],
        });
        roundtrip(Envelope::TlsError {
            stream_id: "s1".into(),
            error: ErrorKind::Internal,
            message: "closed".into(),
        });
        roundtrip(Envelope::UdpData {
            stream_id: "s1".into(),
            data: vec![1],
        });
        roundtrip(Envelope::UdpError {
            stream_id: "s1".into(),
            error: ErrorKind::Internal,
            message: "dropped".into(),
        });
        roundtrip(Envelope::WsOpen {
            stream_id: "s1".into(),
            path: "/socket".into(),
            query: "room=1".into(),
            headers: Headers::new(),
        });
        roundtrip(Envelope::TunnelStatus { message: None });
    }

    #[test]
    fn body_is_base64_in_wire_json() {
        let e = Envelope::HttpResponse {
            request_id: "r1".into(),
            status: 200,
            headers: Headers::new(),
            body: b"ok".to_vec(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"body\":\"b2s=\""));
    }

    #[test]
    fn empty_tcp_payload_means_open_stream() {
        let e = Envelope::TcpData {
            stream_id: "s1".into(),
            data: vec![],
        };
        if let Envelope::TcpData { data, .. } = &e {
            assert!(data.is_empty());
        } else {
            panic!("wrong variant");
        }
    }
}
