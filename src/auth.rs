//! Handshake token validation.
//!
//! Session tokens are issued and checked by an external auth service;
//! this crate only models the seam. The server hands the bearer token
//! from the connection handshake to a [`TokenValidator`] and records the
//! resulting user id on the session. Tests and single-node deployments
//! use [`StaticTokenValidator`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Resolves a bearer token to a user id.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// `Some(user_id)` for a valid token, `None` otherwise.
    async fn validate(&self, token: &str) -> Option<String>;
}

/// Fixed token→user table.
#[derive(Default)]
pub struct StaticTokenValidator {
    tokens: RwLock<HashMap<String, String>>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a user.
    pub async fn insert(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens.write().await.insert(token.into(), user_id.into());
    }

    /// Builder-style registration for test setup.
    pub fn with_token(self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        // Constructed before the runtime is shared, so a blocking write
        // is safe here.
        self.tokens
            .try_write()
            .expect("validator not yet shared")
            .insert(token.into(), user_id.into());
        self
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_valid_token_resolves_user() {
        let validator = StaticTokenValidator::new().with_token("secret-1", "alice");
        assert_eq!(validator.validate("secret-1").await, Some("alice".into()));
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let validator = StaticTokenValidator::new().with_token("secret-1", "alice");
        assert_eq!(validator.validate("wrong").await, None);
    }

    #[tokio::test]
    async fn test_insert_after_construction() {
        let validator = StaticTokenValidator::new();
        assert_eq!(validator.validate("t").await, None);
        validator.insert("t", "bob").await;
        assert_eq!(validator.validate("t").await, Some("bob".into()));
    }
}
