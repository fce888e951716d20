use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

use super::Group;

/// Opaque bearer token persisted in the tokens table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PersistedToken {
    /// Unique identifier for the row
    pub id: Uuid,

    /// User ID this token belongs to
    pub user_id: Uuid,

    /// Device the token was issued to
    pub device_id: String,

    /// SHA-256 hash of the bearer value handed to the client
    pub token_hash: String,

    /// When this token was issued
    pub issued_at: DateTime<Utc>,

    /// When this token expires
    pub expires_at: DateTime<Utc>,
}

impl PersistedToken {
    /// Create a new persisted token valid for `validity` from `now`
    pub fn new(
        user_id: Uuid,
        device_id: String,
        token: &str,
        now: DateTime<Utc>,
        validity: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            device_id,
            token_hash: Self::hash_token(token),
            issued_at: now,
            expires_at: now + validity,
        }
    }

    /// Hash a token using SHA-256
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Check if this token is expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Group snapshot carried in session claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupClaim {
    pub id: Uuid,
    pub name: String,
    pub access_level: i32,
}

impl From<&Group> for GroupClaim {
    fn from(group: &Group) -> Self {
        Self {
            id: group.id,
            name: group.name.clone(),
            access_level: group.access_level,
        }
    }
}

/// What a validated session token says about its bearer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub token_id: String,
    pub user_id: Uuid,
    pub device_id: String,
    pub groups: Vec<GroupClaim>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Token handed to the client along with its claims.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_token_creation() {
        let now = Utc::now();
        let user = Uuid::new_v4();
        let token = PersistedToken::new(user, "dev-1".into(), "token_abc", now, Duration::hours(1));

        assert_eq!(token.user_id, user);
        assert_ne!(token.token_hash, "token_abc");
        assert_eq!(token.token_hash, PersistedToken::hash_token("token_abc"));
        assert_eq!(token.expires_at - token.issued_at, Duration::hours(1));
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let token =
            PersistedToken::new(Uuid::new_v4(), "d".into(), "t", now, Duration::seconds(10));
        assert!(!token.is_expired_at(now + Duration::seconds(9)));
        assert!(token.is_expired_at(now + Duration::seconds(10)));
    }
}
