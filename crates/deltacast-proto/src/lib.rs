//! # Deltacast Protocol
//!
//! Wire envelopes and shape descriptors for the Deltacast broker.
//!
//! ## Frames
//!
//! Every message is one newline-free JSON object: a [`Request`] going up,
//! a [`Response`] coming back. The stream transport delimits frames with
//! newlines; the datagram transport carries one frame per datagram.
//!
//! ## Push notifications
//!
//! A push reuses the response envelope with the [`PUSH_ID`] sentinel id
//! and a push-specific `response.type` tag (`sub-mut` for field changes,
//! `sub-inst` for new instances). Receivers route on `response.type`
//! before consulting their pending-request table.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod shape;

pub use messages::{
    FieldMap, InstanceMap, Request, RequestBody, RequestId, Response, ResponseBody, WireError,
    PUSH_ID,
};
pub use shape::Shape;
