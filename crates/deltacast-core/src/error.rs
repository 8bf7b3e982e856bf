//! Contract errors surfaced in-band to clients.

/// A well-formed request that violates the protocol contract.
///
/// Contract errors are rendered into the `error` field of the matching
/// response; the connection stays open and usable. Malformed frames
/// never reach this type, they are dropped at the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    /// `schema-set` for a topic that already has a schema.
    #[error("schema already exists for topic \"{0}\"")]
    SchemaExists(String),
    /// No schema registered under the topic.
    #[error("no schema for topic \"{0}\"")]
    SchemaNotFound(String),
    /// No instance under the topic with the given id.
    #[error("no instance \"{id}\" under topic \"{topic}\"")]
    InstanceNotFound {
        /// Topic that was addressed.
        topic: String,
        /// Instance id that was not found.
        id: String,
    },
    /// `mut` without a `topic` field.
    #[error("missing msg.topic, cannot mutate record")]
    MutateMissingTopic,
    /// `mut` without an `id` field.
    #[error("missing msg.id, cannot mutate record")]
    MutateMissingId,
    /// `mut` without a `change` field.
    #[error("missing msg.change, cannot mutate record")]
    MutateMissingChange,
    /// Declared request type with no implementation.
    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
}
