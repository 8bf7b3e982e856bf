//! The seam between the router and its connection families.
//!
//! A [`Transport`] binds one socket and serves one connection family.
//! The router never sees sockets: it holds [`ClientHandle`]s, each
//! pairing a connection identity with the transport that owns it, and
//! delivers frames through [`Transport::send_frame`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deltacast_proto::Response;

use crate::router::Router;

/// Connection families a transport can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Long-lived, connection-oriented streams.
    Stream,
    /// Connectionless datagrams.
    Datagram,
}

/// Identity of one peer within a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnKey {
    /// Serial number of an accepted stream connection.
    Stream(u64),
    /// Remote address of a datagram peer.
    Datagram(SocketAddr),
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(serial) => write!(f, "stream#{serial}"),
            Self::Datagram(addr) => write!(f, "udp@{addr}"),
        }
    }
}

/// Process-unique id of a transport instance.
pub type TransportId = u64;

/// Mint a fresh [`TransportId`].
#[must_use]
pub fn next_transport_id() -> TransportId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// One connection family bound to one address.
///
/// Implementations accept peers, decode inbound frames into requests
/// for the router, and deliver responses and pushes back to a specific
/// peer. `send_frame` must not block: the router calls it while holding
/// its state lock, so outbound frames are queued or fired immediately,
/// never awaited.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This transport's process-unique id.
    fn id(&self) -> TransportId;

    /// Which connection family this transport serves.
    fn kind(&self) -> TransportKind;

    /// Bind to `host:port` and start serving `router` in the
    /// background. Returns the bound address, which is useful when
    /// `port` is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    async fn listen(
        self: Arc<Self>,
        router: Arc<Router>,
        host: &str,
        port: u16,
    ) -> Result<SocketAddr, TransportError>;

    /// Queue one already-encoded frame for the peer behind `conn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is gone or the frame cannot be
    /// handed to the socket.
    fn send_frame(&self, conn: &ConnKey, frame: &str) -> Result<(), TransportError>;
}

/// A peer as the router sees it: the transport that owns it plus its
/// connection identity within that transport.
///
/// Equality and hashing use only `(transport id, connection key)`, so
/// repeated messages from one peer resolve to the same handle and a
/// handle can key subscriber sets.
#[derive(Clone)]
pub struct ClientHandle {
    transport_id: TransportId,
    conn: ConnKey,
    transport: Arc<dyn Transport>,
}

impl ClientHandle {
    /// A handle for `conn`, owned by `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, conn: ConnKey) -> Self {
        Self {
            transport_id: transport.id(),
            conn,
            transport,
        }
    }

    /// The connection identity within the owning transport.
    #[must_use]
    pub fn conn(&self) -> &ConnKey {
        &self.conn
    }

    /// Serialize `response` and queue it for this peer.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the peer is gone.
    pub fn send(&self, response: &Response) -> Result<(), TransportError> {
        let frame = response
            .to_frame()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.send_frame(&frame)
    }

    /// Queue an already-encoded frame for this peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is gone.
    pub fn send_frame(&self, frame: &str) -> Result<(), TransportError> {
        self.transport.send_frame(&self.conn, frame)
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.transport_id == other.transport_id && self.conn == other.conn
    }
}

impl Eq for ClientHandle {}

impl Hash for ClientHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transport_id.hash(state);
        self.conn.hash(state);
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("transport_id", &self.transport_id)
            .field("conn", &self.conn)
            .finish()
    }
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.conn)
    }
}

/// Failures at the transport layer. Logged, never fatal to the broker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Binding the listening socket failed.
    #[error("bind {addr} failed: {reason}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying bind failure.
        reason: String,
    },
    /// The peer's connection is no longer tracked.
    #[error("connection {0} is gone")]
    ConnectionGone(ConnKey),
    /// The frame could not be handed to the socket.
    #[error("send to {conn} failed: {reason}")]
    Send {
        /// Target connection.
        conn: ConnKey,
        /// Underlying send failure.
        reason: String,
    },
    /// The frame could not be encoded.
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory transport that records every delivered frame.

    use std::net::SocketAddr;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{
        next_transport_id, ClientHandle, ConnKey, Transport, TransportError, TransportId,
        TransportKind,
    };
    use crate::router::Router;

    pub(crate) struct RecordingTransport {
        id: TransportId,
        sent: Mutex<Vec<(ConnKey, String)>>,
    }

    impl RecordingTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                id: next_transport_id(),
                sent: Mutex::new(Vec::new()),
            })
        }

        /// Handle for the numbered fake connection.
        pub(crate) fn handle(self: &Arc<Self>, conn: u64) -> ClientHandle {
            ClientHandle::new(Arc::clone(self) as Arc<dyn Transport>, ConnKey::Stream(conn))
        }

        /// Frames delivered to `conn`, in delivery order.
        pub(crate) fn frames_for(&self, conn: u64) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter(|(key, _)| *key == ConnKey::Stream(conn))
                .map(|(_, frame)| frame.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn id(&self) -> TransportId {
            self.id
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Stream
        }

        async fn listen(
            self: Arc<Self>,
            _router: Arc<Router>,
            _host: &str,
            port: u16,
        ) -> Result<SocketAddr, TransportError> {
            Ok(SocketAddr::from(([127, 0, 0, 1], port)))
        }

        fn send_frame(&self, conn: &ConnKey, frame: &str) -> Result<(), TransportError> {
            self.sent.lock().push((*conn, frame.to_string()));
            Ok(())
        }
    }
}
