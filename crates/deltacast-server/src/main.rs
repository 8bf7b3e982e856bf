//! # Deltacast Server
//!
//! Broker daemon: one [`Router`] serving the stream (TCP) and datagram
//! (UDP) transports side by side.
//!
//! Configuration comes from `DELTACAST_*` environment variables; the
//! broker stays up until interrupted.

use std::sync::Arc;

use anyhow::Result;
use deltacast_core::{AllowAll, ApiKeyAuthenticator, Authenticator, Router};
use deltacast_transport_tcp::TcpTransport;
use deltacast_transport_udp::{UdpTransport, UdpTransportConfig};
use tracing_subscriber::EnvFilter;

mod config;

pub use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Deltacast broker"
    );

    // Load configuration
    let config = ServerConfig::from_env()?;

    let auth: Arc<dyn Authenticator> = match config.api_keys.clone() {
        Some(keys) => {
            tracing::info!(identities = keys.len(), "Api key authentication enabled");
            Arc::new(ApiKeyAuthenticator::new(keys))
        }
        None => Arc::new(AllowAll),
    };

    let router = Router::new(auth);
    router.add_transport(TcpTransport::new());
    router.add_transport(UdpTransport::with_config(UdpTransportConfig {
        idle_timeout: config.udp_idle_timeout,
        ..UdpTransportConfig::default()
    }));

    let bound = router.listen(&config.host, config.base_port).await?;
    tracing::info!(?bound, "Broker ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    Ok(())
}
