use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::session_token::PersistedToken;

/// API key issued to a client owner. The plaintext key is shown once.
#[derive(Debug, Clone, FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: String,
    /// SHA-256 hex of the key
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn new(user_id: String, key: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            key_hash: PersistedToken::hash_token(key),
            created_at: now,
        }
    }
}
