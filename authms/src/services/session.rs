//! Session credentials: issue, validate, authorize and revoke.
//!
//! Two variants share one interface. Signed tokens are self-contained HS256
//! JWTs carrying a group snapshot. Persisted tokens are opaque random values
//! whose SHA-256 hash keys a row in the token table; their groups are read
//! live at validation time.

use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{SessionConfig, TokenVariant};
use crate::db::CredentialStore;
use crate::models::{Claims, Group, GroupClaim, IssuedToken, PersistedToken};
use crate::services::jwt::JwtService;
use crate::services::tokens::TokenRepository;
use crate::utils::clock::Clock;
use crate::utils::random;

/// Random bytes in an opaque session token.
pub const SESSION_TOKEN_BYTES: usize = 32;

enum Backend {
    Signed(JwtService),
    Persisted(TokenRepository),
}

pub struct SessionService {
    backend: Backend,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    validity: chrono::Duration,
}

fn invalid_token(reason: &str) -> AppError {
    AppError::InvalidToken(anyhow::anyhow!("{}", reason))
}

impl SessionService {
    /// `tokens` is required for the persisted variant and ignored otherwise.
    pub fn new(
        config: &SessionConfig,
        store: Arc<dyn CredentialStore>,
        tokens: Option<TokenRepository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let backend = match config.variant {
            TokenVariant::Signed => Backend::Signed(JwtService::new(&config.secret)?),
            TokenVariant::Persisted => Backend::Persisted(tokens.ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "persisted session tokens need a token store"
                ))
            })?),
        };

        let validity = chrono::Duration::from_std(config.validity)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("invalid session validity: {}", e)))?;

        Ok(Self {
            backend,
            store,
            clock,
            validity,
        })
    }

    pub fn variant(&self) -> TokenVariant {
        match self.backend {
            Backend::Signed(_) => TokenVariant::Signed,
            Backend::Persisted(_) => TokenVariant::Persisted,
        }
    }

    #[tracing::instrument(skip(self, groups))]
    pub async fn issue(
        &self,
        user_id: Uuid,
        device_id: &str,
        groups: &[Group],
    ) -> Result<IssuedToken, AppError> {
        let now = self.clock.now();
        let snapshot: Vec<GroupClaim> = groups.iter().map(GroupClaim::from).collect();

        match &self.backend {
            Backend::Signed(jwt) => {
                let (token, claims) = jwt.generate(user_id, device_id, snapshot, now, self.validity)?;
                Ok(IssuedToken { token, claims })
            }
            Backend::Persisted(tokens) => {
                let token = random::url_safe_token(SESSION_TOKEN_BYTES);
                let row = PersistedToken::new(
                    user_id,
                    device_id.to_string(),
                    &token,
                    now,
                    self.validity,
                );
                tokens
                    .insert(&row)
                    .await
                    .map_err(|e| e.context("store session token"))?;

                Ok(IssuedToken {
                    token,
                    claims: Claims {
                        token_id: row.id.to_string(),
                        user_id,
                        device_id: row.device_id,
                        groups: snapshot,
                        issued_at: row.issued_at,
                        expires_at: row.expires_at,
                    },
                })
            }
        }
    }

    /// Malformed, forged or unknown tokens are `InvalidToken`; a token past
    /// its expiry is `TokenExpired`. An expired persisted row is deleted on
    /// the spot.
    pub async fn validate(&self, token: &str) -> Result<Claims, AppError> {
        if token.trim().is_empty() {
            return Err(invalid_token("token was empty"));
        }

        let now = self.clock.now();
        match &self.backend {
            Backend::Signed(jwt) => {
                let claims = jwt.decode(token)?;
                if now >= claims.expires_at {
                    return Err(AppError::TokenExpired(anyhow::anyhow!("session token expired")));
                }
                Ok(claims)
            }
            Backend::Persisted(tokens) => {
                let row = match tokens.find(&PersistedToken::hash_token(token)).await {
                    Ok(row) => row,
                    Err(e) if e.is_not_found() => return Err(invalid_token("unknown token")),
                    Err(e) => return Err(e),
                };

                if row.is_expired_at(now) {
                    if let Err(e) = tokens.delete(&row).await {
                        tracing::warn!(error = %e, token_id = %row.id, "Failed to delete expired token");
                    }
                    return Err(AppError::TokenExpired(anyhow::anyhow!("session token expired")));
                }

                let groups = self.store.user_groups(row.user_id).await?;
                Ok(Claims {
                    token_id: row.id.to_string(),
                    user_id: row.user_id,
                    device_id: row.device_id,
                    groups: groups.iter().map(GroupClaim::from).collect(),
                    issued_at: row.issued_at,
                    expires_at: row.expires_at,
                })
            }
        }
    }

    /// True iff the claims hold `required` by id.
    pub fn authorize(claims: &Claims, required: &Group) -> bool {
        claims.groups.iter().any(|g| g.id == required.id)
    }

    /// Deletes a persisted token. Signed tokens cannot be revoked.
    pub async fn revoke(&self, token: &str) -> Result<(), AppError> {
        match &self.backend {
            Backend::Signed(_) => Err(AppError::NotImplemented(anyhow::anyhow!(
                "signed session tokens cannot be revoked"
            ))),
            Backend::Persisted(tokens) => {
                let row = match tokens.find(&PersistedToken::hash_token(token)).await {
                    Ok(row) => row,
                    Err(e) if e.is_not_found() => return Err(invalid_token("unknown token")),
                    Err(e) => return Err(e),
                };
                tokens.delete(&row).await?;
                tracing::info!(user_id = %row.user_id, "Session token revoked");
                Ok(())
            }
        }
    }
}
