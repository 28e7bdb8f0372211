//! Server configuration surface (`spec.md` §6 "Environment").
//!
//! Generalizes the teacher's hardcoded `0.0.0.0:7070` into a proper
//! `clap::Parser` struct with an environment-variable fallback per field,
//! the way `other_examples`' relay binaries (e.g. localup's exit node)
//! expose their server configuration.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "tunneld", about = "Reverse tunnel relay server")]
pub struct ServerConfig {
    /// Address the public HTTP/control-channel listener binds to.
    #[arg(long, env = "TUNNELD_HTTP_ADDR", default_value = "0.0.0.0:7070")]
    pub http_addr: String,

    /// Base domain tunnels are exposed under, e.g. "example.test" makes a
    /// tunnel with subdomain "abcd1234" reachable at
    /// "abcd1234.example.test".
    #[arg(long, env = "TUNNELD_BASE_DOMAIN", default_value = "example.test")]
    pub base_domain: String,

    /// Override used when base_domain resolution should fall back to a
    /// local/loopback form (e.g. for docs and local development).
    #[arg(long, env = "TUNNELD_LOCALHOST_DOMAIN")]
    pub localhost_domain: Option<String>,

    /// First port in the range used for TCP/TLS/UDP tunnels.
    #[arg(long, env = "TUNNELD_PORT_BASE", default_value_t = 20000)]
    pub port_base: u16,

    /// Number of ports in the TCP/TLS/UDP allocation range.
    #[arg(long, env = "TUNNELD_PORT_RANGE", default_value_t = 1000)]
    pub port_range: u16,

    /// Region label reported in `init_response` and used to build public
    /// URLs when relevant.
    #[arg(long, env = "TUNNELD_REGION", default_value = "local")]
    pub region: String,

    /// Public website URL, surfaced in error pages.
    #[arg(long, env = "TUNNELD_WEBSITE_URL", default_value = "https://example.test")]
    pub website_url: String,

    /// Additional allowed origins for the control-channel upgrade,
    /// comma-separated.
    #[arg(long, env = "TUNNELD_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Shared HMAC secret used by the bundled `HmacJwtValidator` stand-in.
    #[arg(long, env = "TUNNELD_JWT_SECRET", default_value = "dev-secret-change-me")]
    pub jwt_secret: String,
}

impl ServerConfig {
    /// Prefer `localhost_domain` when the caller has configured one and
    /// the requested host actually resolves to loopback; otherwise fall
    /// back to `base_domain`. Mirrors the "or a localhost fallback" clause
    /// of `spec.md` §4.4 "Public URL is derived from...".
    pub fn domain_for_public_url(&self) -> &str {
        self.localhost_domain
            .as_deref()
            .unwrap_or(&self.base_domain)
    }
}
