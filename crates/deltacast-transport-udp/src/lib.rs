//! # Deltacast UDP Transport
//!
//! The connectionless transport: one JSON frame per datagram.
//!
//! Peers are tracked by last-seen time as bookkeeping only; a
//! background sweeper evicts entries that have been silent past the
//! idle timeout so the table cannot grow without bound. Delivery does
//! not consult the table: outbound frames go to the address carried
//! in the connection key with a non-blocking send, so eviction never
//! cuts off a quiet subscriber. Each inbound datagram is handled on
//! its own task, so a slow `auth` round trip never stalls the
//! receive loop.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deltacast_core::{
    next_transport_id, ClientHandle, ConnKey, Router, Transport, TransportError, TransportId,
    TransportKind,
};
use deltacast_proto::Request;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

/// Configuration for the UDP transport.
#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    /// Receive buffer size, and therefore the largest accepted frame.
    pub max_datagram_len: usize,
    /// How long a peer may stay silent before it is evicted.
    pub idle_timeout: Duration,
    /// How often the sweeper looks for idle peers.
    pub sweep_interval: Duration,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        Self {
            max_datagram_len: 64 * 1024,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Connectionless [`Transport`] over UDP.
pub struct UdpTransport {
    id: TransportId,
    config: UdpTransportConfig,
    socket: OnceCell<Arc<UdpSocket>>,
    peers: Mutex<HashMap<SocketAddr, Instant>>,
}

impl UdpTransport {
    /// A UDP transport with the default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(UdpTransportConfig::default())
    }

    /// A UDP transport with the given configuration.
    #[must_use]
    pub fn with_config(config: UdpTransportConfig) -> Arc<Self> {
        Arc::new(Self {
            id: next_transport_id(),
            config,
            socket: OnceCell::new(),
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// How many peers are currently tracked.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    fn handle_datagram(self: &Arc<Self>, router: &Arc<Router>, peer: SocketAddr, payload: &[u8]) {
        let frame = match std::str::from_utf8(payload) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "Dropping non-UTF-8 datagram");
                return;
            }
        };
        match Request::from_frame(frame) {
            Ok(request) => {
                // Only decoded traffic marks the peer as seen.
                self.peers.lock().insert(peer, Instant::now());
                let handle = ClientHandle::new(
                    Arc::clone(self) as Arc<dyn Transport>,
                    ConnKey::Datagram(peer),
                );
                let router = Arc::clone(router);
                tokio::spawn(async move {
                    router.handle_request(&handle, request).await;
                });
            }
            Err(err) => {
                tracing::warn!(%peer, error = %err, "Dropping undecodable datagram");
            }
        }
    }

    fn sweep_idle_peers(&self) {
        let idle_timeout = self.config.idle_timeout;
        self.peers.lock().retain(|addr, last_seen| {
            if last_seen.elapsed() < idle_timeout {
                true
            } else {
                tracing::debug!(peer = %addr, "Evicting idle datagram peer");
                false
            }
        });
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn listen(
        self: Arc<Self>,
        router: Arc<Router>,
        host: &str,
        port: u16,
    ) -> Result<SocketAddr, TransportError> {
        let addr = format!("{host}:{port}");
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|e| TransportError::Bind {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = socket.local_addr().map_err(|e| TransportError::Bind {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
        let socket = Arc::new(socket);
        self.socket
            .set(Arc::clone(&socket))
            .map_err(|_| TransportError::Bind {
                addr,
                reason: "transport is already bound".to_string(),
            })?;

        let sweeper = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.config.sweep_interval);
            loop {
                ticker.tick().await;
                sweeper.sweep_idle_peers();
            }
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; self.config.max_datagram_len];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, peer)) => self.handle_datagram(&router, peer, &buf[..len]),
                    Err(err) => {
                        tracing::warn!(error = %err, "Datagram receive failed");
                    }
                }
            }
        });

        Ok(local_addr)
    }

    fn send_frame(&self, conn: &ConnKey, frame: &str) -> Result<(), TransportError> {
        let ConnKey::Datagram(peer) = conn else {
            return Err(TransportError::ConnectionGone(*conn));
        };
        let socket = self
            .socket
            .get()
            .ok_or(TransportError::ConnectionGone(*conn))?;
        socket
            .try_send_to(frame.as_bytes(), *peer)
            .map_err(|e| TransportError::Send {
                conn: *conn,
                reason: e.to_string(),
            })?;
        Ok(())
    }
}
