//! HTTP-01 token registry
//!
//! The engine records `token -> key authorization` while a challenge is
//! presented; the challenge listener answers
//! `GET /.well-known/acme-challenge/{token}` from it.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Thread-safe store for pending ACME challenges
#[derive(Debug, Default)]
pub struct ChallengeStore {
    challenges: RwLock<HashMap<String, String>>,
}

impl ChallengeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_challenge(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Adding HTTP-01 challenge to store");
        self.challenges
            .write()
            .await
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub async fn remove_challenge(&self, token: &str) {
        debug!(token = %token, "Removing HTTP-01 challenge from store");
        self.challenges.write().await.remove(token);
    }

    /// Key authorization for `token`, if a challenge is pending
    pub async fn get_challenge(&self, token: &str) -> Option<String> {
        self.challenges.read().await.get(token).cloned()
    }

    pub async fn len(&self) -> usize {
        self.challenges.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.challenges.read().await.is_empty()
    }
}
