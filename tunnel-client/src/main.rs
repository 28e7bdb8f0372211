//! `tunnel` — the reverse tunnel fabric's client agent binary.

use clap::Parser;
use tracing::info;

use tunnel_client::{ClientConfig, ClientSession};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_client=info".into()),
        )
        .init();

    let config = ClientConfig::parse();
    info!(
        server = %config.server_url,
        protocol = ?config.protocol,
        local = %config.local_url,
        "starting tunnel client"
    );

    let session = ClientSession::new(config);
    session.run().await;
}
