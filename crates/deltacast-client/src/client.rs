//! The broker connection: request surface, pending table, reader task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use deltacast_proto::{
    FieldMap, InstanceMap, Request, RequestBody, RequestId, Response, ResponseBody, Shape,
    WireError,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::events::{CallbackRegistry, EventCallback, TopicEvent};

/// Errors surfaced by [`Client`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connecting to the broker failed.
    #[error("connect to {addr} failed: {reason}")]
    Connect {
        /// Address that was dialed.
        addr: String,
        /// Underlying connect failure.
        reason: String,
    },
    /// The connection is closed; the request was or would be abandoned.
    #[error("connection closed")]
    ConnectionClosed,
    /// The broker answered the request with an error.
    #[error("request rejected: {0}")]
    Rejected(String),
    /// The request could not be encoded.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Writing the request frame to the socket failed.
    #[error("frame write failed: {0}")]
    Write(String),
    /// The reply decoded but lacks the payload its type promises.
    #[error("malformed reply: {0}")]
    MalformedReply(&'static str),
}

struct Inner {
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Response>>>,
    callbacks: CallbackRegistry,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
}

impl Inner {
    /// Route one inbound frame: pushes go to callbacks, everything else
    /// resolves its pending entry.
    fn dispatch(&self, response: Response) {
        match response.response {
            ResponseBody::PushMutation { topic, id, change } => {
                self.emit(&TopicEvent::Mutation { topic, id, change });
            }
            ResponseBody::PushNewInstance { topic, id } => {
                self.emit(&TopicEvent::NewInstance { topic, id });
            }
            _ => {
                let waiter = self.pending.lock().remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::debug!(id = response.id, "Reply without a waiting request");
                    }
                }
            }
        }
    }

    fn emit(&self, event: &TopicEvent) {
        for callback in self.callbacks.matching(event) {
            callback(event);
        }
    }

    /// Mark the connection closed and reject every pending request.
    /// Dropping the senders wakes their waiters.
    fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
    }
}

/// A connection to a broker's stream endpoint.
///
/// Cloning shares the connection. Any number of requests may be in
/// flight at once; replies correlate by id, never by order. Push
/// notifications are dispatched from the reader task in the order the
/// broker applied the changes.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Dial `host:port` and start the reader task.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ClientError> {
        let addr = format!("{host}:{port}");
        let socket = TcpStream::connect(&addr)
            .await
            .map_err(|e| ClientError::Connect {
                addr,
                reason: e.to_string(),
            })?;
        Ok(Self::from_stream(socket))
    }

    /// Wrap an already-connected stream.
    #[must_use]
    pub fn from_stream(socket: TcpStream) -> Self {
        let (read_half, write_half) = socket.into_split();
        let inner = Arc::new(Inner {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            callbacks: CallbackRegistry::default(),
            writer: AsyncMutex::new(Some(write_half)),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(read_loop(Arc::downgrade(&inner), read_half));
        Self { inner }
    }

    /// Authenticate with free-form credentials. Returns the identity
    /// the broker granted.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the credentials or the
    /// connection fails.
    pub async fn auth(&self, credentials: Value) -> Result<String, ClientError> {
        let response = self.request(RequestBody::Auth(credentials)).await?;
        match response.response {
            ResponseBody::Auth { id: Some(identity) } => Ok(identity),
            _ => Err(ClientError::MalformedReply("auth reply without an identity")),
        }
    }

    /// Register a schema for `topic`. The first writer wins; a second
    /// registration is rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic already has a schema or the
    /// connection fails.
    pub async fn create_schema(&self, topic: &str, shape: Shape) -> Result<(), ClientError> {
        self.request(RequestBody::SchemaSet {
            topic: topic.to_string(),
            shape,
        })
        .await
        .map(|_| ())
    }

    /// Fetch the shape registered for `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic has no schema or the connection
    /// fails.
    pub async fn schema(&self, topic: &str) -> Result<Shape, ClientError> {
        let response = self
            .request(RequestBody::SchemaGet {
                topic: topic.to_string(),
            })
            .await?;
        match response.response {
            ResponseBody::SchemaGet { shape: Some(shape) } => Ok(shape),
            _ => Err(ClientError::MalformedReply("schema-get reply without a shape")),
        }
    }

    /// Whether `topic` has a schema. A broker rejection reads as
    /// `false`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the connection fails.
    pub async fn has_schema(&self, topic: &str) -> Result<bool, ClientError> {
        match self.schema(topic).await {
            Ok(_) => Ok(true),
            Err(ClientError::Rejected(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Mint a fresh, empty instance under `topic`. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic has no schema or the connection
    /// fails.
    pub async fn create_instance(&self, topic: &str) -> Result<String, ClientError> {
        let response = self
            .request(RequestBody::Instance {
                topic: topic.to_string(),
            })
            .await?;
        match response.response {
            ResponseBody::Instance { id: Some(id) } => Ok(id),
            _ => Err(ClientError::MalformedReply("instance reply without an id")),
        }
    }

    /// Propose field values for instance `id` of `topic`. The broker
    /// writes the fields that differ and pushes that delta to
    /// subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic or instance is unknown or the
    /// connection fails.
    pub async fn mutate(&self, topic: &str, id: &str, change: FieldMap) -> Result<(), ClientError> {
        self.request(RequestBody::Mutate {
            topic: Some(topic.to_string()),
            id: Some(id.to_string()),
            change: Some(change),
        })
        .await
        .map(|_| ())
    }

    /// Subscribe `callback` to every instance of `topic`: new instances
    /// and every mutation.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn subscribe<F>(&self, topic: &str, callback: F) -> Result<(), ClientError>
    where
        F: Fn(&TopicEvent) + Send + Sync + 'static,
    {
        self.subscribe_with(topic, None, Arc::new(callback)).await
    }

    /// Subscribe `callback` to mutations of one instance of `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn subscribe_instance<F>(
        &self,
        topic: &str,
        id: &str,
        callback: F,
    ) -> Result<(), ClientError>
    where
        F: Fn(&TopicEvent) + Send + Sync + 'static,
    {
        self.subscribe_with(topic, Some(id), Arc::new(callback))
            .await
    }

    async fn subscribe_with(
        &self,
        topic: &str,
        instance: Option<&str>,
        callback: EventCallback,
    ) -> Result<(), ClientError> {
        // Registered before the request goes out, so a push that beats
        // the sub reply still finds its callback.
        self.inner.callbacks.register(topic, instance, callback);
        self.request(RequestBody::Subscribe {
            topic: topic.to_string(),
            id: instance.map(str::to_string),
        })
        .await
        .map(|_| ())
    }

    /// Every instance of `topic`, keyed by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic has no schema or the connection
    /// fails.
    pub async fn list(&self, topic: &str) -> Result<InstanceMap, ClientError> {
        let response = self
            .request(RequestBody::List {
                topic: topic.to_string(),
            })
            .await?;
        match response.response {
            ResponseBody::List { list: Some(list) } => Ok(list),
            _ => Err(ClientError::MalformedReply("list reply without a listing")),
        }
    }

    /// Round-trip `msg` through the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn echo(&self, msg: &str) -> Result<String, ClientError> {
        let response = self
            .request(RequestBody::Echo {
                msg: msg.to_string(),
            })
            .await?;
        match response.response {
            ResponseBody::Echo { msg } => Ok(msg),
            _ => Err(ClientError::MalformedReply("echo reply without a message")),
        }
    }

    /// Close the connection. Every pending request is rejected with
    /// [`ClientError::ConnectionClosed`], as are later ones.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.writer.lock().await.take();
        self.inner.shut_down();
    }

    async fn request(&self, body: RequestBody) -> Result<Response, ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionClosed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        // A close racing the insert above must still reject this entry.
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.pending.lock().remove(&id);
            return Err(ClientError::ConnectionClosed);
        }

        let frame = Request { id, body }.to_frame()?;
        if let Err(err) = self.send_frame(&frame).await {
            self.inner.pending.lock().remove(&id);
            return Err(err);
        }

        let response = rx.await.map_err(|_| ClientError::ConnectionClosed)?;
        match response.error {
            Some(reason) => Err(ClientError::Rejected(reason)),
            None => Ok(response),
        }
    }

    async fn send_frame(&self, frame: &str) -> Result<(), ClientError> {
        let mut writer = self.inner.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(ClientError::ConnectionClosed);
        };
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| ClientError::Write(e.to_string()))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| ClientError::Write(e.to_string()))?;
        Ok(())
    }
}

/// Decode frames off the socket until it closes, then reject whatever
/// is still pending. Holds only a weak handle so an abandoned client is
/// torn down instead of kept alive by its own reader.
async fn read_loop(inner: Weak<Inner>, read_half: OwnedReadHalf) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let Some(inner) = inner.upgrade() else { return };
                let frame = line.trim_end();
                if frame.is_empty() {
                    continue;
                }
                match Response::from_frame(frame) {
                    Ok(response) => inner.dispatch(response),
                    Err(err) => {
                        tracing::warn!(error = %err, "Dropping undecodable frame");
                    }
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "Read failed, closing connection");
                break;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.shut_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    async fn write_frame(write_half: &mut OwnedWriteHalf, response: &Response) {
        let frame = response.to_frame().unwrap();
        write_half.write_all(frame.as_bytes()).await.unwrap();
        write_half.write_all(b"\n").await.unwrap();
    }

    async fn next_request(
        lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
    ) -> Request {
        let line = lines.next_line().await.unwrap().unwrap();
        Request::from_frame(&line).unwrap()
    }

    #[tokio::test]
    async fn replies_correlate_by_id_not_arrival_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let first = next_request(&mut lines).await;
            let second = next_request(&mut lines).await;

            // Answer in reverse order; each reply echoes its own text.
            for request in [second, first] {
                let RequestBody::Echo { msg } = request.body else {
                    panic!("unexpected request");
                };
                write_frame(&mut write_half, &Response::ok(request.id, ResponseBody::Echo { msg }))
                    .await;
            }
            std::future::pending::<()>().await;
        });

        let client = Client::connect("127.0.0.1", addr.port()).await.unwrap();
        let (a, b) = tokio::join!(client.echo("a"), client.echo("b"));
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
    }

    #[tokio::test]
    async fn broker_errors_surface_as_rejections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let request = next_request(&mut lines).await;
            write_frame(
                &mut write_half,
                &Response::fail(
                    request.id,
                    ResponseBody::List { list: None },
                    "no schema for topic \"ghosts\"",
                ),
            )
            .await;
            std::future::pending::<()>().await;
        });

        let client = Client::connect("127.0.0.1", addr.port()).await.unwrap();
        let err = client.list("ghosts").await.unwrap_err();
        assert!(
            matches!(&err, ClientError::Rejected(reason) if reason == "no schema for topic \"ghosts\"")
        );
    }

    #[tokio::test]
    async fn has_schema_reads_rejection_as_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let request = next_request(&mut lines).await;
            write_frame(
                &mut write_half,
                &Response::fail(
                    request.id,
                    ResponseBody::SchemaGet { shape: None },
                    "no schema for topic \"players\"",
                ),
            )
            .await;

            let request = next_request(&mut lines).await;
            write_frame(
                &mut write_half,
                &Response::ok(
                    request.id,
                    ResponseBody::SchemaGet {
                        shape: Some(Shape::Number),
                    },
                ),
            )
            .await;
            std::future::pending::<()>().await;
        });

        let client = Client::connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(!client.has_schema("players").await.unwrap());
        assert!(client.has_schema("players").await.unwrap());
    }

    #[tokio::test]
    async fn push_arriving_before_the_sub_reply_is_not_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let request = next_request(&mut lines).await;
            assert!(matches!(request.body, RequestBody::Subscribe { .. }));

            write_frame(
                &mut write_half,
                &Response::push(ResponseBody::PushMutation {
                    topic: "players".to_string(),
                    id: "p1".to_string(),
                    change: fields(json!({"x": 1})),
                }),
            )
            .await;
            write_frame(&mut write_half, &Response::ok(request.id, ResponseBody::Subscribe)).await;
            std::future::pending::<()>().await;
        });

        let client = Client::connect("127.0.0.1", addr.port()).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client
            .subscribe("players", move |event| sink.lock().push(event.clone()))
            .await
            .unwrap();

        // The push preceded the sub reply on the stream, so it was
        // dispatched before subscribe resolved.
        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![TopicEvent::Mutation {
                topic: "players".to_string(),
                id: "p1".to_string(),
                change: fields(json!({"x": 1})),
            }]
        );
    }

    #[tokio::test]
    async fn callbacks_fire_scoped_tier_first_in_broker_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            for _ in 0..2 {
                let request = next_request(&mut lines).await;
                write_frame(&mut write_half, &Response::ok(request.id, ResponseBody::Subscribe))
                    .await;
            }

            for id in ["p1", "p2"] {
                write_frame(
                    &mut write_half,
                    &Response::push(ResponseBody::PushMutation {
                        topic: "players".to_string(),
                        id: id.to_string(),
                        change: fields(json!({"x": 1})),
                    }),
                )
                .await;
            }
            write_frame(
                &mut write_half,
                &Response::push(ResponseBody::PushNewInstance {
                    topic: "players".to_string(),
                    id: "p3".to_string(),
                }),
            )
            .await;

            let request = next_request(&mut lines).await;
            let RequestBody::Echo { msg } = request.body else {
                panic!("unexpected request");
            };
            write_frame(&mut write_half, &Response::ok(request.id, ResponseBody::Echo { msg }))
                .await;
            std::future::pending::<()>().await;
        });

        let client = Client::connect("127.0.0.1", addr.port()).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        client
            .subscribe_instance("players", "p1", move |event| {
                sink.lock().push(format!("scoped:{}", event.id()));
            })
            .await
            .unwrap();
        let sink = Arc::clone(&seen);
        client
            .subscribe("players", move |event| {
                sink.lock().push(format!("wide:{}", event.id()));
            })
            .await
            .unwrap();

        // The echo reply follows every push on the stream, so once it
        // resolves all pushes have been dispatched.
        client.echo("done").await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec!["scoped:p1", "wide:p1", "wide:p2", "wide:p3"]
        );
    }

    #[tokio::test]
    async fn connection_loss_rejects_pending_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            // Read the request, then drop the connection unanswered.
            lines.next_line().await.unwrap();
        });

        let client = Client::connect("127.0.0.1", addr.port()).await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), client.echo("hello"))
            .await
            .expect("request was not rejected")
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
    }

    #[tokio::test]
    async fn close_rejects_pending_and_later_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            lines.next_line().await.unwrap();
            let _ = seen_tx.send(());
            // Keep the socket open and never reply.
            std::future::pending::<()>().await;
        });

        let client = Client::connect("127.0.0.1", addr.port()).await.unwrap();
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.echo("never").await }
        });
        seen_rx.await.unwrap();

        client.close().await;
        let err = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("pending request was not rejected")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert!(matches!(
            client.echo("again").await.unwrap_err(),
            ClientError::ConnectionClosed
        ));
    }
}
