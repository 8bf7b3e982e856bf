//! Pluggable authentication.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

/// Rejection from an [`Authenticator`].
///
/// The reason string is surfaced verbatim in the `auth` response's
/// `error` field.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct AuthError(String);

impl AuthError {
    /// A rejection with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Resolves `auth` credentials into a client identity.
///
/// The credential payload is free-form JSON, interpreted entirely by the
/// implementation. Implementations may perform I/O; the router awaits
/// them without holding its state lock, and the authenticator can be
/// swapped at runtime via [`crate::Router::set_authenticator`].
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Resolve `credentials` to an identity string.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] if the credentials are rejected.
    async fn authenticate(&self, credentials: &Value) -> Result<String, AuthError>;
}

/// Accepts everyone, identifying each client as `"anonymous"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _credentials: &Value) -> Result<String, AuthError> {
        Ok("anonymous".to_string())
    }
}

/// Resolves a static `apiKey` credential to an identity.
///
/// Expects credentials shaped `{"apiKey": "..."}`.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyAuthenticator {
    keys: HashMap<String, String>,
}

impl ApiKeyAuthenticator {
    /// An authenticator over `key -> identity` pairs.
    #[must_use]
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    /// Register one key/identity pair.
    pub fn insert(&mut self, key: impl Into<String>, identity: impl Into<String>) {
        self.keys.insert(key.into(), identity.into());
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, credentials: &Value) -> Result<String, AuthError> {
        let key = credentials
            .get("apiKey")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::new("missing apiKey"))?;
        self.keys
            .get(key)
            .cloned()
            .ok_or_else(|| AuthError::new("unknown apiKey"))
    }
}
