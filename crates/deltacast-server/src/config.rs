//! Broker configuration.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,

    /// Transports bind `base_port + 1`, `base_port + 2`, ... in
    /// registration order.
    pub base_port: u16,

    /// Api key to identity map. `None` leaves the broker open and every
    /// client authenticates as `"anonymous"`.
    pub api_keys: Option<HashMap<String, String>>,

    /// How long a datagram peer may stay silent before eviction.
    pub udp_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            base_port: 4500,
            api_keys: None,
            udp_idle_timeout: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DELTACAST_HOST`: interface to bind
    /// - `DELTACAST_BASE_PORT`: transports bind base + 1, base + 2, ...
    /// - `DELTACAST_API_KEYS`: JSON object of api key to identity
    /// - `DELTACAST_UDP_IDLE_SECS`: datagram peer idle eviction, seconds
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but unparseable.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("DELTACAST_HOST") {
            config.host = host;
        }

        if let Ok(port) = std::env::var("DELTACAST_BASE_PORT") {
            config.base_port = port.parse().context("Invalid DELTACAST_BASE_PORT")?;
        }

        if let Ok(keys_json) = std::env::var("DELTACAST_API_KEYS") {
            config.api_keys =
                Some(serde_json::from_str(&keys_json).context("Invalid DELTACAST_API_KEYS JSON")?);
        }

        if let Ok(secs) = std::env::var("DELTACAST_UDP_IDLE_SECS") {
            let secs: u64 = secs.parse().context("Invalid DELTACAST_UDP_IDLE_SECS")?;
            config.udp_idle_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}
