use service_core::error::AppError;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::db::CredentialStore;
use crate::models::{ApiKey, PersistedToken};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::random;

/// Length of freshly minted API keys.
pub const API_KEY_LEN: usize = 56;

/// API key pair presented with every engine call.
#[derive(Clone)]
pub struct ApiCredentials {
    pub user_id: String,
    pub key: String,
}

impl ApiCredentials {
    pub fn new(user_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("user_id", &self.user_id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Establishes that a caller holds a valid API key: either the master key
/// or one minted for the caller's user id.
#[derive(Clone)]
pub struct ApiGuard {
    store: Arc<dyn CredentialStore>,
    master_key: String,
    clock: Arc<dyn Clock>,
}

impl ApiGuard {
    pub fn new(store: Arc<dyn CredentialStore>, master_key: impl Into<String>) -> Self {
        Self {
            store,
            master_key: master_key.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn api_key_valid(&self, user_id: &str, key: &str) -> Result<(), AppError> {
        if key.is_empty() {
            return Err(AppError::Unauthorized(anyhow::anyhow!("API key required")));
        }

        if !self.master_key.is_empty() && constant_time_eq(key, &self.master_key) {
            return Ok(());
        }

        let presented = PersistedToken::hash_token(key);
        let keys = self.store.api_keys_for(user_id).await?;
        if keys
            .iter()
            .any(|k| constant_time_eq(&presented, &k.key_hash))
        {
            return Ok(());
        }

        tracing::warn!(user_id = %user_id, "Rejected API key");
        Err(AppError::Unauthorized(anyhow::anyhow!("invalid API key")))
    }

    pub async fn check(&self, creds: &ApiCredentials) -> Result<(), AppError> {
        self.api_key_valid(&creds.user_id, &creds.key).await
    }

    /// Mints a key for `user_id`. The plaintext is returned once and only its
    /// hash is stored.
    pub async fn new_api_key(&self, user_id: &str) -> Result<String, AppError> {
        if user_id.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("user id was empty")));
        }

        let key = random::alphanumeric(API_KEY_LEN);
        self.store
            .insert_api_key(&ApiKey::new(user_id.to_string(), &key, self.clock.now()))
            .await
            .map_err(|e| e.context("store API key"))?;

        tracing::info!(user_id = %user_id, "Issued API key");
        Ok(key)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn guard() -> ApiGuard {
        ApiGuard::new(Arc::new(MemoryStore::new()), "master-key")
    }

    #[tokio::test]
    async fn test_master_key_accepted_for_any_user() {
        tokio_test::assert_ok!(guard().api_key_valid("anyone", "master-key").await);
    }

    #[tokio::test]
    async fn test_minted_key_is_bound_to_its_user() {
        let guard = guard();
        let key = guard.new_api_key("client-a").await.unwrap();
        assert_eq!(key.len(), API_KEY_LEN);

        tokio_test::assert_ok!(guard.api_key_valid("client-a", &key).await);
        assert!(guard.api_key_valid("client-b", &key).await.unwrap_err().is_auth());
    }

    #[tokio::test]
    async fn test_empty_inputs() {
        let guard = guard();
        assert!(guard.api_key_valid("client-a", "").await.unwrap_err().is_auth());
        assert!(guard.new_api_key("  ").await.unwrap_err().is_client());
    }

    #[tokio::test]
    async fn test_empty_master_key_never_matches() {
        let guard = ApiGuard::new(Arc::new(MemoryStore::new()), "");
        assert!(guard.api_key_valid("client-a", "x").await.is_err());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let rendered = format!("{:?}", ApiCredentials::new("client", "super-secret"));
        assert!(!rendered.contains("super-secret"));
    }
}
