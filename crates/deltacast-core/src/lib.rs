//! # Deltacast Core
//!
//! The broker core: schema and instance storage, the two-tier
//! subscription index, request dispatch, and the transport and
//! authentication seams.
//!
//! ## Model
//!
//! Clients define a named, typed schema per topic, mint record instances
//! under it, and mutate instance fields. Every applied mutation is
//! reduced to the delta of fields that actually changed and fanned out
//! to subscribers: instance-scoped subscribers first, then every
//! topic-wide subscriber.
//!
//! ## Concurrency
//!
//! One [`Router`] owns all shared state behind a single lock, so each
//! request is applied to completion before the next. Push notifications
//! are queued to subscribers inside the same critical section as the
//! mutation, which keeps per-subscriber push order equal to mutation
//! order. The pluggable [`Authenticator`] is the only suspension point
//! in dispatch and is awaited without holding the lock.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod error;
pub mod router;
pub mod store;
pub mod subscriptions;
pub mod transport;

pub use auth::{AllowAll, ApiKeyAuthenticator, AuthError, Authenticator};
pub use error::ContractError;
pub use router::Router;
pub use store::SchemaStore;
pub use subscriptions::SubscriptionIndex;
pub use transport::{
    next_transport_id, ClientHandle, ConnKey, Transport, TransportError, TransportId,
    TransportKind,
};
