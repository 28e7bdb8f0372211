//! Tunnel identity and the four supported protocol shapes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the four protocol shapes a tunnel can expose.
///
/// Carried in `init` and persisted on the `TunnelIdentity`. `Http` is
/// routed by virtual host on the server's single public port; `Tcp`,
/// `Tls`, and `Udp` each receive a dedicated public port from the
/// configured range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Tcp,
    Tls,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Udp => "udp",
        }
    }

    /// Whether this protocol is routed by virtual host rather than by a
    /// dedicated allocated port.
    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http)
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            "tls" => Ok(Protocol::Tls),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a `TunnelIdentity`, as tracked by the durable
/// registry. `Inactive` is how a dashboard-initiated disconnect is
/// represented (`spec.md` §4.4 "Disconnect propagation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Active,
    Inactive,
}

/// Stable identifier of a tunnel across reconnects (`spec.md` §3).
///
/// Mutated only by the server; the only field that may change across a
/// resume is `local_url` (§9 open question (b): the tunnel id itself is
/// immutable post-init).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelIdentity {
    pub id: Uuid,
    pub subdomain: String,
    pub protocol: Protocol,
    /// URL for `http`; `host:port` for `tcp`/`tls`/`udp`.
    pub local_url: String,
    pub owner_user_id: String,
    pub custom_domain: Option<String>,
    pub status: TunnelStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_active_at: i64,
    /// Public port allocated for `tcp`/`tls`/`udp` tunnels. `None` for `http`.
    pub public_port: Option<u16>,
}

impl TunnelIdentity {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subdomain: String,
        protocol: Protocol,
        local_url: String,
        owner_user_id: String,
        custom_domain: Option<String>,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subdomain,
            protocol,
            local_url,
            owner_user_id,
            custom_domain,
            status: TunnelStatus::Active,
            created_at: now,
            updated_at: now,
            last_active_at: now,
            public_port: None,
        }
    }
}
