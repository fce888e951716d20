//! Verification code model - single-use OTPs proving control of a channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::LoginType;

/// Contact channels that carry verification codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Phone,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Phone => "phone",
            Channel::Email => "email",
        }
    }

    pub fn login_type(&self) -> LoginType {
        match self {
            Channel::Phone => LoginType::Phone,
            Channel::Email => LoginType::Email,
        }
    }

    pub fn from_login_type(login_type: LoginType) -> Option<Self> {
        match login_type {
            LoginType::Phone => Some(Channel::Phone),
            LoginType::Email => Some(Channel::Email),
            LoginType::Username | LoginType::Facebook => None,
        }
    }
}

/// Verification code entity. Only the hash of the code is ever stored.
#[derive(Debug, Clone)]
pub struct VerificationCode {
    pub id: Uuid,
    pub user_id: Uuid,
    pub address: String,
    pub channel: Channel,
    pub code_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expiry_at: DateTime<Utc>,
    pub is_used: bool,
}

impl VerificationCode {
    pub fn new(
        user_id: Uuid,
        address: String,
        channel: Channel,
        code_hash: String,
        issued_at: DateTime<Utc>,
        expiry_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            address,
            channel,
            code_hash,
            issued_at,
            expiry_at,
            is_used: false,
        }
    }

    /// Check if the code has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_at
    }

    /// Unused and not yet expired.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_used && !self.is_expired_at(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_code_validity_window() {
        let now = Utc::now();
        let code = VerificationCode::new(
            Uuid::new_v4(),
            "+254712345678".into(),
            Channel::Phone,
            "$argon2id$...".into(),
            now,
            now + Duration::minutes(5),
        );
        assert!(code.is_valid_at(now));
        assert!(code.is_valid_at(now + Duration::minutes(4)));
        assert!(!code.is_valid_at(now + Duration::minutes(5)));

        let used = VerificationCode { is_used: true, ..code };
        assert!(!used.is_valid_at(now));
    }
}
