//! # Deltacast TCP Transport
//!
//! The connection-oriented transport: newline-delimited JSON frames over
//! long-lived TCP connections.
//!
//! Each accepted connection gets a serial number, a reader task that
//! decodes frames and hands requests to the router, and a writer task
//! fed by an unbounded queue so [`Transport::send_frame`] never blocks.
//! The queue also keeps outbound frames in FIFO order, which is what
//! gives subscribers their mutation-ordered pushes. A connection's
//! bookkeeping is removed the moment it closes; there is no timeout.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deltacast_core::{
    next_transport_id, ClientHandle, ConnKey, Router, Transport, TransportError, TransportId,
    TransportKind,
};
use deltacast_proto::Request;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

/// Configuration for the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Longest frame the codec will accept before dropping the
    /// connection that sent it.
    pub max_frame_len: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 64 * 1024,
        }
    }
}

/// Connection-oriented [`Transport`] over TCP.
pub struct TcpTransport {
    id: TransportId,
    config: TcpTransportConfig,
    conns: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_conn: AtomicU64,
}

impl TcpTransport {
    /// A TCP transport with the default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(TcpTransportConfig::default())
    }

    /// A TCP transport with the given configuration.
    #[must_use]
    pub fn with_config(config: TcpTransportConfig) -> Arc<Self> {
        Arc::new(Self {
            id: next_transport_id(),
            config,
            conns: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
        })
    }

    /// How many connections are currently tracked.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Serve one accepted connection until its stream ends.
    ///
    /// The reader half handles requests in arrival order, so one slow
    /// request (an authenticator doing I/O) stalls only this
    /// connection. The writer half drains the outbound queue; replies
    /// and pushes queued before the connection closed are still
    /// flushed.
    async fn serve_connection(
        self: Arc<Self>,
        router: Arc<Router>,
        socket: TcpStream,
        peer: SocketAddr,
        serial: u64,
    ) {
        let framed = Framed::new(
            socket,
            LinesCodec::new_with_max_length(self.config.max_frame_len),
        );
        let (mut sink, mut stream) = framed.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.conns.lock().insert(serial, tx);

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    tracing::warn!(error = %err, "Frame write failed, closing connection");
                    break;
                }
            }
        });

        let handle = ClientHandle::new(
            Arc::clone(&self) as Arc<dyn Transport>,
            ConnKey::Stream(serial),
        );
        tracing::debug!(%peer, conn = %handle, "Connection accepted");

        while let Some(next) = stream.next().await {
            match next {
                Ok(line) => match Request::from_frame(&line) {
                    Ok(request) => router.handle_request(&handle, request).await,
                    Err(err) => {
                        tracing::warn!(conn = %handle, error = %err, "Dropping undecodable frame");
                    }
                },
                Err(err) => {
                    tracing::warn!(conn = %handle, error = %err, "Stream error, dropping connection");
                    break;
                }
            }
        }

        self.conns.lock().remove(&serial);
        tracing::debug!(conn = %handle, "Connection closed");
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn listen(
        self: Arc<Self>,
        router: Arc<Router>,
        host: &str,
        port: u16,
    ) -> Result<SocketAddr, TransportError> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TransportError::Bind {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr,
            reason: e.to_string(),
        })?;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let serial = self.next_conn.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(Arc::clone(&self).serve_connection(
                            Arc::clone(&router),
                            socket,
                            peer,
                            serial,
                        ));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Accept failed");
                    }
                }
            }
        });

        Ok(local_addr)
    }

    fn send_frame(&self, conn: &ConnKey, frame: &str) -> Result<(), TransportError> {
        let ConnKey::Stream(serial) = conn else {
            return Err(TransportError::ConnectionGone(*conn));
        };
        let conns = self.conns.lock();
        let tx = conns
            .get(serial)
            .ok_or(TransportError::ConnectionGone(*conn))?;
        tx.send(frame.to_string())
            .map_err(|_| TransportError::ConnectionGone(*conn))
    }
}
