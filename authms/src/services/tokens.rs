use service_core::error::AppError;
use std::sync::Arc;

use crate::db::TokenStore;
use crate::models::PersistedToken;
use crate::services::gc::GcNotifier;

/// Token table access for the session engine. Every mutation is reported to
/// the garbage collector.
#[derive(Clone)]
pub struct TokenRepository {
    store: Arc<dyn TokenStore>,
    gc: GcNotifier,
}

impl TokenRepository {
    pub fn new(store: Arc<dyn TokenStore>, gc: GcNotifier) -> Self {
        Self { store, gc }
    }

    pub async fn insert(&self, token: &PersistedToken) -> Result<(), AppError> {
        self.store.insert_token(token).await?;
        self.gc.inserted(token);
        Ok(())
    }

    pub async fn find(&self, token_hash: &str) -> Result<PersistedToken, AppError> {
        self.store.token_by_hash(token_hash).await
    }

    pub async fn delete(&self, token: &PersistedToken) -> Result<bool, AppError> {
        let removed = self.store.delete_token(&token.token_hash).await?;
        self.gc.deleted(token);
        Ok(removed)
    }
}
