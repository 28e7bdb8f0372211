//! Client configuration surface (`spec.md` §4.3, §6).
//!
//! A `clap::Parser` struct, the same pattern `tunnel_server::config` uses:
//! one flag per setting, each with an environment-variable fallback and a
//! sensible default, generalizing the teacher's hardcoded
//! `ws://127.0.0.1:7070/ws` into a proper CLI surface.

use clap::Parser;
use tunnel_protocol::Protocol;

#[derive(Parser, Debug, Clone)]
#[command(name = "tunnel", about = "Reverse tunnel client agent")]
pub struct ClientConfig {
    /// Base URL of the tunnel server's control channel, e.g.
    /// "ws://relay.example.test:7070".
    #[arg(long, env = "TUNNEL_SERVER_URL", default_value = "ws://127.0.0.1:7070")]
    pub server_url: String,

    /// Protocol shape this tunnel exposes.
    #[arg(long, value_enum)]
    pub protocol: ProtocolArg,

    /// Local target: a URL for `http`, or `host:port` for `tcp`/`tls`/`udp`.
    #[arg(long)]
    pub local_url: String,

    /// Bearer token or `ur_`-prefixed API key sent in `init`.
    #[arg(long, env = "TUNNEL_TOKEN")]
    pub token: String,

    /// Requested subdomain. Ignored if a saved identity exists and
    /// applies (see `spec.md` §4.3 "Init").
    #[arg(long)]
    pub subdomain: Option<String>,

    /// Requested custom domain.
    #[arg(long)]
    pub host: Option<String>,

    /// Force allocation of a fresh identity, ignoring any saved resume
    /// state and any requested subdomain conflict resolution.
    #[arg(long)]
    pub force_new: bool,

    /// Skip loading/writing the local resume-state file.
    #[arg(long)]
    pub no_resume: bool,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolArg {
    Http,
    Tcp,
    Tls,
    Udp,
}

impl From<ProtocolArg> for Protocol {
    fn from(p: ProtocolArg) -> Self {
        match p {
            ProtocolArg::Http => Protocol::Http,
            ProtocolArg::Tcp => Protocol::Tcp,
            ProtocolArg::Tls => Protocol::Tls,
            ProtocolArg::Udp => Protocol::Udp,
        }
    }
}
