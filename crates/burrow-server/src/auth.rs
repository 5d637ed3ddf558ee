//! Authentication collaborators for the `auth` command
//!
//! This trait keeps the control plane independent of the credential scheme,
//! so deployments can plug in their own checks and tests can run open.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::endpoint::{generate_endpoint_id, is_valid_endpoint_id, normalize};

/// Errors from authenticating a control channel
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid endpoint id: {0:?}")]
    InvalidEndpoint(String),

    #[error("Malformed auth params: {0}")]
    MalformedParams(String),
}

/// Decides whether an `auth` command succeeds and which endpoint it gets
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check the opaque `params` of an `auth` command
    ///
    /// # Returns
    /// The endpoint id the session should be registered under
    async fn authenticate(&self, params: &Value) -> Result<String, AuthError>;
}

/// Endpoint assignment shared by the built-in authenticators: a client may
/// ask for `params.endpointId`, otherwise one is generated.
fn assign_endpoint(params: &Value) -> Result<String, AuthError> {
    match params.get("endpointId") {
        None | Some(Value::Null) => Ok(generate_endpoint_id()),
        Some(Value::String(requested)) => {
            let endpoint_id = normalize(requested);
            if is_valid_endpoint_id(&endpoint_id) {
                Ok(endpoint_id)
            } else {
                Err(AuthError::InvalidEndpoint(requested.clone()))
            }
        }
        Some(other) => Err(AuthError::MalformedParams(format!(
            "endpointId must be a string, got {}",
            other
        ))),
    }
}

/// Accepts every client
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAuthenticator;

#[async_trait]
impl Authenticator for OpenAuthenticator {
    async fn authenticate(&self, params: &Value) -> Result<String, AuthError> {
        assign_endpoint(params)
    }
}

/// Accepts clients presenting one of a fixed set of tokens in `params.token`
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    tokens: HashSet<String>,
}

impl TokenAuthenticator {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, params: &Value) -> Result<String, AuthError> {
        let token = params
            .get("token")
            .and_then(Value::as_str)
            .ok_or(AuthError::InvalidCredentials)?;

        if !self.tokens.contains(token) {
            return Err(AuthError::InvalidCredentials);
        }

        assign_endpoint(params)
    }
}

/// Pick the authenticator for a token list: open when empty
pub fn authenticator_for(tokens: &[String]) -> Arc<dyn Authenticator> {
    if tokens.is_empty() {
        Arc::new(OpenAuthenticator)
    } else {
        Arc::new(TokenAuthenticator::new(tokens.iter().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_generates_endpoint() {
        let id = OpenAuthenticator.authenticate(&json!({})).await.unwrap();
        assert!(is_valid_endpoint_id(&id));

        // Null params (as sent by `{"command":"auth"}`) are fine too
        let id = OpenAuthenticator.authenticate(&Value::Null).await.unwrap();
        assert!(is_valid_endpoint_id(&id));
    }

    #[tokio::test]
    async fn test_requested_endpoint_is_normalized() {
        let id = OpenAuthenticator
            .authenticate(&json!({ "endpointId": "MyApp" }))
            .await
            .unwrap();
        assert_eq!(id, "myapp");
    }

    #[tokio::test]
    async fn test_invalid_requested_endpoint() {
        let err = OpenAuthenticator
            .authenticate(&json!({ "endpointId": "my.app" }))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidEndpoint(_)));

        let err = OpenAuthenticator
            .authenticate(&json!({ "endpointId": 42 }))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedParams(_)));
    }

    #[tokio::test]
    async fn test_token_authenticator() {
        let auth = TokenAuthenticator::new(["secret"]);

        let id = auth
            .authenticate(&json!({ "token": "secret", "endpointId": "abc123" }))
            .await
            .unwrap();
        assert_eq!(id, "abc123");

        assert!(matches!(
            auth.authenticate(&json!({ "token": "wrong" })).await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.authenticate(&json!({})).await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_authenticator_for() {
        let open = authenticator_for(&[]);
        assert!(open.authenticate(&json!({})).await.is_ok());

        let guarded = authenticator_for(&["t1".to_string()]);
        assert!(guarded.authenticate(&json!({})).await.is_err());
        assert!(guarded.authenticate(&json!({ "token": "t1" })).await.is_ok());
    }
}
