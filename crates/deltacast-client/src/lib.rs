//! # Deltacast Client
//!
//! An async client that mirrors broker-side record changes into local
//! callbacks.
//!
//! The client speaks the stream transport: one JSON frame per line over
//! TCP. Requests may overlap freely and correlate by id, never by
//! arrival order. Push notifications for subscribed topics run the
//! registered callbacks on the reader task, instance-scoped callbacks
//! before topic-wide ones, in the order the broker applied the
//! mutations.
//!
//! ```no_run
//! # async fn run() -> Result<(), deltacast_client::ClientError> {
//! use deltacast_client::Client;
//!
//! let client = Client::connect("127.0.0.1", 4501).await?;
//! client
//!     .subscribe("players", |event| println!("{event:?}"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod client;
mod events;

pub use client::{Client, ClientError};
pub use events::{EventCallback, TopicEvent};
