//! Request, response, and push-notification envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::shape::Shape;

/// Correlation id carried by every frame.
///
/// Senders allocate ids starting at 1; [`PUSH_ID`] is reserved.
pub type RequestId = i64;

/// Sentinel id marking an unsolicited push rather than a reply.
pub const PUSH_ID: RequestId = -1;

/// One record instance: field name to JSON value.
pub type FieldMap = serde_json::Map<String, Value>;

/// Every instance of a topic, keyed by instance id.
pub type InstanceMap = HashMap<String, FieldMap>;

/// A client request: correlation id plus a typed payload.
///
/// On the wire the payload contributes the `type` and `msg` keys, so the
/// frame reads `{"id": n, "type": "...", "msg": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Sender-chosen id, unique among that sender's in-flight requests.
    pub id: RequestId,
    /// The typed payload.
    #[serde(flatten)]
    pub body: RequestBody,
}

impl Request {
    /// Encode as one newline-free JSON frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_frame(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Decode from a JSON frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a well-formed request.
    pub fn from_frame(frame: &str) -> Result<Self, WireError> {
        serde_json::from_str(frame).map_err(|e| WireError::Decode(e.to_string()))
    }
}

/// Request payloads, tagged by the wire `type` string.
///
/// The enum is closed: a frame whose `type` is not listed here fails to
/// decode, and the transport logs and drops it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "msg", rename_all = "kebab-case")]
pub enum RequestBody {
    /// Authenticate with implementation-defined credentials.
    Auth(Value),
    /// Create a schema for a topic. First writer wins.
    SchemaSet {
        /// Topic to define.
        topic: String,
        /// Root shape of the topic's records.
        shape: Shape,
    },
    /// Fetch the shape registered for a topic.
    SchemaGet {
        /// Topic to look up.
        topic: String,
    },
    /// Mint a fresh, empty instance under a topic.
    Instance {
        /// Topic to instantiate.
        topic: String,
    },
    /// Mutate fields of one instance.
    ///
    /// Each field is optional on the wire so that a missing one is
    /// answered with its own contract error instead of a dropped frame.
    #[serde(rename = "mut")]
    Mutate {
        /// Topic owning the instance.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        /// Instance to mutate.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Proposed field values.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        change: Option<FieldMap>,
    },
    /// Subscribe to a whole topic, or to one instance when `id` is given.
    #[serde(rename = "sub")]
    Subscribe {
        /// Topic of interest.
        topic: String,
        /// Instance scope, when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Declared but unimplemented; always answered with an error.
    #[serde(rename = "unsub")]
    Unsubscribe {
        /// Topic to drop.
        topic: String,
    },
    /// List every instance of a topic.
    List {
        /// Topic to list.
        topic: String,
    },
    /// Liveness probe; the text comes back unchanged.
    Echo {
        /// Arbitrary text to echo.
        msg: String,
    },
}

/// A reply or push notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Echo of the originating request id, or [`PUSH_ID`] for pushes.
    pub id: RequestId,
    /// The typed result.
    pub response: ResponseBody,
    /// Present when the request failed its contract; `response` then
    /// carries only its `type` tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A successful reply correlated to `id`.
    #[must_use]
    pub fn ok(id: RequestId, response: ResponseBody) -> Self {
        Self {
            id,
            response,
            error: None,
        }
    }

    /// A failed reply: `response` keeps only its type tag and `error`
    /// carries the reason.
    #[must_use]
    pub fn fail(id: RequestId, response: ResponseBody, error: impl Into<String>) -> Self {
        Self {
            id,
            response,
            error: Some(error.into()),
        }
    }

    /// An unsolicited push notification.
    #[must_use]
    pub fn push(response: ResponseBody) -> Self {
        Self {
            id: PUSH_ID,
            response,
            error: None,
        }
    }

    /// Whether this frame is a push rather than a reply.
    #[must_use]
    pub fn is_push(&self) -> bool {
        matches!(
            self.response,
            ResponseBody::PushMutation { .. } | ResponseBody::PushNewInstance { .. }
        )
    }

    /// Encode as one newline-free JSON frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_frame(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Decode from a JSON frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a well-formed response.
    pub fn from_frame(frame: &str) -> Result<Self, WireError> {
        serde_json::from_str(frame).map_err(|e| WireError::Decode(e.to_string()))
    }
}

/// Response payloads, tagged by the wire `type` string.
///
/// Per-type fields are optional so an error reply can carry the tag
/// alone. The two push tags never appear in direct replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResponseBody {
    /// Reply to `auth`; `id` is the resolved identity.
    Auth {
        /// Identity granted by the authenticator.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Reply to `schema-set`.
    SchemaSet,
    /// Reply to `schema-get`.
    SchemaGet {
        /// The topic's registered shape.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shape: Option<Shape>,
    },
    /// Reply to `instance`; `id` is the freshly minted instance id.
    Instance {
        /// Id of the new instance.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Reply to `mut`.
    #[serde(rename = "mut")]
    Mutate,
    /// Reply to `sub`.
    #[serde(rename = "sub")]
    Subscribe,
    /// Reply to `unsub`; always paired with an error.
    #[serde(rename = "unsub")]
    Unsubscribe,
    /// Reply to `list`.
    List {
        /// Every instance of the topic, keyed by id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        list: Option<InstanceMap>,
    },
    /// Reply to `echo`.
    Echo {
        /// The echoed text.
        msg: String,
    },
    /// Push: fields of an instance changed.
    #[serde(rename = "sub-mut")]
    PushMutation {
        /// Topic owning the instance.
        topic: String,
        /// Mutated instance.
        id: String,
        /// The fields that actually changed.
        change: FieldMap,
    },
    /// Push: a new instance appeared under a topic.
    #[serde(rename = "sub-inst")]
    PushNewInstance {
        /// Topic owning the instance.
        topic: String,
        /// Id of the new instance.
        id: String,
    },
}

/// Errors for frame encoding/decoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Encoding failed
    #[error("frame encoding failed: {0}")]
    Encode(String),
    /// Decoding failed
    #[error("frame decoding failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn request_frame_layout() {
        let request = Request {
            id: 4,
            body: RequestBody::Mutate {
                topic: Some("players".to_string()),
                id: Some("p1".to_string()),
                change: Some(fields(json!({"x": 1}))),
            },
        };

        let frame = request.to_frame().unwrap();
        assert!(!frame.contains('\n'));

        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["id"], json!(4));
        assert_eq!(value["type"], json!("mut"));
        assert_eq!(value["msg"], json!({"topic": "players", "id": "p1", "change": {"x": 1}}));

        let decoded = Request::from_frame(&frame).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn mutate_fields_decode_independently() {
        let decoded = Request::from_frame(r#"{"id":2,"type":"mut","msg":{}}"#).unwrap();
        assert_eq!(
            decoded.body,
            RequestBody::Mutate {
                topic: None,
                id: None,
                change: None,
            }
        );

        let decoded =
            Request::from_frame(r#"{"id":3,"type":"mut","msg":{"topic":"players"}}"#).unwrap();
        assert!(matches!(
            decoded.body,
            RequestBody::Mutate { topic: Some(_), id: None, change: None }
        ));
    }

    #[test]
    fn unknown_request_type_rejected() {
        assert!(Request::from_frame(r#"{"id":1,"type":"drop-table","msg":{}}"#).is_err());
        assert!(Request::from_frame(r#"{"type":"echo","msg":{"msg":"hi"}}"#).is_err());
        assert!(Request::from_frame("not json").is_err());
    }

    #[test]
    fn subscribe_payload_shapes() {
        let decoded =
            Request::from_frame(r#"{"id":7,"type":"sub","msg":{"topic":"players"}}"#).unwrap();
        assert_eq!(
            decoded.body,
            RequestBody::Subscribe {
                topic: "players".to_string(),
                id: None,
            }
        );

        let request = Request {
            id: 8,
            body: RequestBody::Subscribe {
                topic: "players".to_string(),
                id: Some("p1".to_string()),
            },
        };
        let value: Value = serde_json::from_str(&request.to_frame().unwrap()).unwrap();
        assert_eq!(value["msg"], json!({"topic": "players", "id": "p1"}));
    }

    #[test]
    fn push_frames_use_sentinel_id() {
        let push = Response::push(ResponseBody::PushMutation {
            topic: "players".to_string(),
            id: "p1".to_string(),
            change: fields(json!({"x": 2})),
        });
        assert!(push.is_push());

        let frame = push.to_frame().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["id"], json!(-1));
        assert_eq!(value["response"]["type"], json!("sub-mut"));
        assert_eq!(value["response"]["change"], json!({"x": 2}));

        let decoded = Response::from_frame(&frame).unwrap();
        assert_eq!(decoded.id, PUSH_ID);
        assert!(decoded.is_push());
    }

    #[test]
    fn error_reply_keeps_type_tag_only() {
        let reply = Response::fail(9, ResponseBody::SchemaGet { shape: None }, "no schema for topic \"ghosts\"");
        assert!(!reply.is_push());

        let value: Value = serde_json::from_str(&reply.to_frame().unwrap()).unwrap();
        assert_eq!(value["id"], json!(9));
        assert_eq!(value["response"], json!({"type": "schema-get"}));
        assert_eq!(value["error"], json!("no schema for topic \"ghosts\""));
    }

    #[test]
    fn success_reply_omits_error_field() {
        let reply = Response::ok(5, ResponseBody::Echo { msg: "hi".to_string() });
        let value: Value = serde_json::from_str(&reply.to_frame().unwrap()).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["response"], json!({"type": "echo", "msg": "hi"}));
    }
}
