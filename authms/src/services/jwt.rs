use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{Claims, GroupClaim};

/// HS256 signer for stateless session tokens.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

/// Claims as they travel inside the token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionTokenClaims {
    /// Subject (user ID)
    sub: Uuid,
    /// JWT ID
    jti: String,
    /// Device the token was issued to
    dev: String,
    /// Group snapshot at issue time
    groups: Vec<GroupClaim>,
    /// Issued at (Unix timestamp)
    iat: i64,
    /// Expiration time (Unix timestamp)
    exp: i64,
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AppError::InvalidToken(anyhow::anyhow!("timestamp out of range")))
}

impl JwtService {
    pub fn new(secret: &str) -> Result<Self, AppError> {
        if secret.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "session token secret cannot be empty"
            )));
        }

        tracing::info!("JWT service initialized with HS256 key");

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    /// Sign a token valid from `now` for `validity`.
    ///
    /// Times are carried at second precision; the returned claims are the
    /// ones [`JwtService::decode`] will yield.
    pub fn generate(
        &self,
        user_id: Uuid,
        device_id: &str,
        groups: Vec<GroupClaim>,
        now: DateTime<Utc>,
        validity: Duration,
    ) -> Result<(String, Claims), AppError> {
        let claims = SessionTokenClaims {
            sub: user_id,
            jti: Uuid::new_v4().to_string(),
            dev: device_id.to_string(),
            groups,
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
        };

        let header = Header::new(Algorithm::HS256);
        let token = encode(&header, &claims, &self.encoding_key).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to encode session token: {}", e))
        })?;

        Ok((token, Self::into_claims(claims)?))
    }

    /// Check the signature and decode. Expiry is judged by the caller against
    /// its own clock.
    pub fn decode(&self, token: &str) -> Result<Claims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let token_data = decode::<SessionTokenClaims>(token, &self.decoding_key, &validation)?;
        Self::into_claims(token_data.claims)
    }

    fn into_claims(raw: SessionTokenClaims) -> Result<Claims, AppError> {
        Ok(Claims {
            token_id: raw.jti,
            user_id: raw.sub,
            device_id: raw.dev,
            groups: raw.groups,
            issued_at: timestamp(raw.iat)?,
            expires_at: timestamp(raw.exp)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_secret_rejected() {
        assert!(JwtService::new("").is_err());
    }

    #[test]
    fn test_token_generation_and_decoding() -> Result<(), AppError> {
        let service = JwtService::new("test-secret")?;
        let user = Uuid::new_v4();
        let groups = vec![GroupClaim {
            id: Uuid::new_v4(),
            name: "admin".into(),
            access_level: 3,
        }];

        let (token, issued) =
            service.generate(user, "dev-1", groups.clone(), Utc::now(), Duration::hours(1))?;
        assert!(!token.is_empty());

        let decoded = service.decode(&token)?;
        assert_eq!(decoded, issued);
        assert_eq!(decoded.user_id, user);
        assert_eq!(decoded.groups, groups);
        assert_eq!(decoded.expires_at - decoded.issued_at, Duration::hours(1));
        Ok(())
    }

    #[test]
    fn test_wrong_key_is_invalid_token() -> Result<(), AppError> {
        let (token, _) = JwtService::new("key-one")?.generate(
            Uuid::new_v4(),
            "dev",
            vec![],
            Utc::now(),
            Duration::hours(1),
        )?;

        let err = JwtService::new("key-two")?.decode(&token).unwrap_err();
        assert!(matches!(err, AppError::InvalidToken(_)));
        assert!(JwtService::new("key-two")?.decode("garbage").is_err());
        Ok(())
    }
}
