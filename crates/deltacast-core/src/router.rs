//! Request dispatch, state ownership, and push fan-out.

use std::net::SocketAddr;
use std::sync::Arc;

use deltacast_proto::{
    FieldMap, Request, RequestBody, RequestId, Response, ResponseBody, Shape,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::auth::Authenticator;
use crate::error::ContractError;
use crate::store::SchemaStore;
use crate::subscriptions::SubscriptionIndex;
use crate::transport::{ClientHandle, Transport, TransportError};

/// Store and index behind the router's single lock.
#[derive(Default)]
struct RouterState {
    store: SchemaStore,
    subs: SubscriptionIndex,
}

/// The broker core: owns all shared state, dispatches every decoded
/// request, and fans pushes out to subscribers.
///
/// One router serves any number of transports. Every mutation of the
/// store or the subscription index happens under one lock, so each
/// request is applied to completion before the next. Push frames
/// triggered by `mut` and `instance` are encoded once and queued to
/// every affected subscriber inside the same critical section, which
/// keeps per-subscriber push order equal to mutation order. The direct
/// response is sent after dispatch and is not ordered relative to the
/// pushes other clients receive.
pub struct Router {
    state: Mutex<RouterState>,
    auth: RwLock<Arc<dyn Authenticator>>,
    transports: Mutex<Vec<Arc<dyn Transport>>>,
}

impl Router {
    /// A router with no transports and the given authenticator.
    #[must_use]
    pub fn new(auth: Arc<dyn Authenticator>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RouterState::default()),
            auth: RwLock::new(auth),
            transports: Mutex::new(Vec::new()),
        })
    }

    /// Swap the authenticator. In-flight `auth` requests finish with
    /// the one they started with.
    pub fn set_authenticator(&self, auth: Arc<dyn Authenticator>) {
        *self.auth.write() = auth;
    }

    /// Register a transport. It starts serving on [`Router::listen`].
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.transports.lock().push(transport);
    }

    /// Bind every registered transport on `host`, assigning
    /// `base_port + 1`, `base_port + 2`, ... in registration order.
    /// Returns the bound addresses in the same order.
    ///
    /// # Errors
    ///
    /// Returns the first bind failure; transports bound before it keep
    /// running.
    pub async fn listen(
        self: &Arc<Self>,
        host: &str,
        base_port: u16,
    ) -> Result<Vec<SocketAddr>, TransportError> {
        let transports: Vec<Arc<dyn Transport>> = self.transports.lock().clone();
        let mut bound = Vec::with_capacity(transports.len());
        let mut port = base_port;
        for transport in transports {
            port += 1;
            let kind = transport.kind();
            let addr = transport.listen(Arc::clone(self), host, port).await?;
            tracing::info!(%addr, ?kind, "Transport listening");
            bound.push(addr);
        }
        Ok(bound)
    }

    /// Dispatch one decoded request from `client` and send the reply
    /// back through the transport that produced it.
    ///
    /// Contract violations are answered in-band; only the delivery of
    /// the reply itself can fail, which is logged and absorbed.
    pub async fn handle_request(&self, client: &ClientHandle, request: Request) {
        let Request { id, body } = request;

        let response = match body {
            RequestBody::Auth(credentials) => self.handle_auth(id, &credentials).await,
            RequestBody::SchemaSet { topic, shape } => self.handle_schema_set(id, &topic, shape),
            RequestBody::SchemaGet { topic } => self.handle_schema_get(id, &topic),
            RequestBody::Instance { topic } => self.handle_instance(id, &topic),
            RequestBody::Mutate { topic, id: instance_id, change } => {
                self.handle_mutate(id, topic, instance_id, change)
            }
            RequestBody::Subscribe { topic, id: instance } => {
                self.handle_subscribe(client, id, &topic, instance.as_deref())
            }
            RequestBody::Unsubscribe { .. } => Response::fail(
                id,
                ResponseBody::Unsubscribe,
                ContractError::Unimplemented("unsub").to_string(),
            ),
            RequestBody::List { topic } => self.handle_list(id, &topic),
            RequestBody::Echo { msg } => Response::ok(id, ResponseBody::Echo { msg }),
        };

        if let Err(err) = client.send(&response) {
            tracing::warn!(client = %client, error = %err, "Reply delivery failed");
        }
    }

    async fn handle_auth(&self, id: RequestId, credentials: &Value) -> Response {
        let auth = Arc::clone(&*self.auth.read());
        match auth.authenticate(credentials).await {
            Ok(identity) => {
                tracing::info!(identity, "Client authenticated");
                Response::ok(id, ResponseBody::Auth { id: Some(identity) })
            }
            Err(err) => Response::fail(id, ResponseBody::Auth { id: None }, err.to_string()),
        }
    }

    fn handle_schema_set(&self, id: RequestId, topic: &str, shape: Shape) -> Response {
        match self.state.lock().store.create_schema(topic, shape) {
            Ok(()) => Response::ok(id, ResponseBody::SchemaSet),
            Err(err) => Response::fail(id, ResponseBody::SchemaSet, err.to_string()),
        }
    }

    fn handle_schema_get(&self, id: RequestId, topic: &str) -> Response {
        match self.state.lock().store.schema(topic) {
            Ok(shape) => Response::ok(
                id,
                ResponseBody::SchemaGet {
                    shape: Some(shape.clone()),
                },
            ),
            Err(err) => Response::fail(id, ResponseBody::SchemaGet { shape: None }, err.to_string()),
        }
    }

    fn handle_instance(&self, id: RequestId, topic: &str) -> Response {
        let state = &mut *self.state.lock();
        match state.store.create_instance(topic) {
            Ok(instance_id) => {
                let push = Response::push(ResponseBody::PushNewInstance {
                    topic: topic.to_string(),
                    id: instance_id.clone(),
                });
                if let Some(frame) = Self::push_frame(&push) {
                    state
                        .subs
                        .fan_out_new_instance(topic, |client| Self::deliver_push(client, &frame));
                }
                Response::ok(
                    id,
                    ResponseBody::Instance {
                        id: Some(instance_id),
                    },
                )
            }
            Err(err) => Response::fail(id, ResponseBody::Instance { id: None }, err.to_string()),
        }
    }

    fn handle_mutate(
        &self,
        id: RequestId,
        topic: Option<String>,
        instance_id: Option<String>,
        change: Option<FieldMap>,
    ) -> Response {
        match self.apply_mutation(topic, instance_id, change) {
            Ok(()) => Response::ok(id, ResponseBody::Mutate),
            Err(err) => Response::fail(id, ResponseBody::Mutate, err.to_string()),
        }
    }

    /// Validate, apply, and fan out one mutation. Nothing is written
    /// when any of the payload fields is missing.
    fn apply_mutation(
        &self,
        topic: Option<String>,
        instance_id: Option<String>,
        change: Option<FieldMap>,
    ) -> Result<(), ContractError> {
        let topic = topic.ok_or(ContractError::MutateMissingTopic)?;
        let instance_id = instance_id.ok_or(ContractError::MutateMissingId)?;
        let change = change.ok_or(ContractError::MutateMissingChange)?;

        let state = &mut *self.state.lock();
        let delta = state.store.apply_mutation(&topic, &instance_id, change)?;

        // An all-identical change still announces itself with an empty
        // delta, matching what subscribers have always observed.
        let push = Response::push(ResponseBody::PushMutation {
            topic: topic.clone(),
            id: instance_id.clone(),
            change: delta,
        });
        if let Some(frame) = Self::push_frame(&push) {
            state
                .subs
                .fan_out_mutation(&topic, &instance_id, |client| {
                    Self::deliver_push(client, &frame);
                });
        }
        Ok(())
    }

    fn handle_subscribe(
        &self,
        client: &ClientHandle,
        id: RequestId,
        topic: &str,
        instance: Option<&str>,
    ) -> Response {
        self.state
            .lock()
            .subs
            .subscribe(topic, instance, client.clone());
        Response::ok(id, ResponseBody::Subscribe)
    }

    fn handle_list(&self, id: RequestId, topic: &str) -> Response {
        match self.state.lock().store.list_instances(topic) {
            Ok(list) => Response::ok(id, ResponseBody::List { list: Some(list) }),
            Err(err) => Response::fail(id, ResponseBody::List { list: None }, err.to_string()),
        }
    }

    /// Encode a push once for delivery to every subscriber.
    fn push_frame(push: &Response) -> Option<String> {
        match push.to_frame() {
            Ok(frame) => Some(frame),
            Err(err) => {
                tracing::warn!(error = %err, "Push encoding failed");
                None
            }
        }
    }

    fn deliver_push(client: &ClientHandle, frame: &str) {
        if let Err(err) = client.send_frame(frame) {
            tracing::warn!(client = %client, error = %err, "Push delivery failed");
        }
    }
}
