//! Third-party token validation.
//!
//! Providers are registered once at startup in an [`OAuthRegistry`]; the
//! registry is immutable afterwards and shared behind an `Arc`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::FacebookConfig;

pub const FACEBOOK: &str = "facebook";

const FACEBOOK_DEBUG_TOKEN_URL: &str = "https://graph.facebook.com/debug_token";

/// What a provider vouches for after validating an app token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OAuthIdentity {
    pub remote_user_id: String,
    pub scopes: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait OAuthValidator: Send + Sync {
    /// Fails with an Auth error when the provider rejects the token.
    async fn validate_token(&self, app_token: &str) -> Result<OAuthIdentity, AppError>;
}

#[derive(Default)]
pub struct OAuthRegistry {
    providers: HashMap<String, Arc<dyn OAuthValidator>>,
}

impl OAuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, name: &str, validator: Arc<dyn OAuthValidator>) -> Self {
        self.providers.insert(name.to_lowercase(), validator);
        self
    }

    /// Unknown providers are a client error.
    pub fn get(&self, name: &str) -> Result<Arc<dyn OAuthValidator>, AppError> {
        self.providers
            .get(&name.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!("OAuth provider '{}' is not supported", name))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct DebugTokenResponse {
    data: DebugTokenData,
}

#[derive(Debug, Deserialize)]
struct DebugTokenData {
    #[serde(default)]
    is_valid: bool,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

/// Validates user access tokens through the Graph API `debug_token` endpoint.
#[derive(Clone)]
pub struct FacebookValidator {
    client: Client,
    app_token: String,
}

impl FacebookValidator {
    pub fn new(config: &FacebookConfig, timeout: Duration) -> Result<Self, AppError> {
        if config.app_id.trim().is_empty() || config.app_secret.trim().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "facebook app id and secret must both be set"
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to build OAuth client: {}", e)))?;

        Ok(Self {
            client,
            app_token: format!("{}|{}", config.app_id, config.app_secret),
        })
    }
}

#[async_trait]
impl OAuthValidator for FacebookValidator {
    async fn validate_token(&self, app_token: &str) -> Result<OAuthIdentity, AppError> {
        let response = self
            .client
            .get(FACEBOOK_DEBUG_TOKEN_URL)
            .query(&[("input_token", app_token), ("access_token", self.app_token.as_str())])
            .send()
            .await
            .map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("error communicating with facebook: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = %status, "Facebook rejected debug_token request");
            return Err(AppError::InternalError(anyhow::anyhow!(
                "error communicating with facebook ({})",
                status
            )));
        }

        let body: DebugTokenResponse = response.json().await.map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("error reading facebook response: {}", e))
        })?;

        if !body.data.is_valid || body.data.user_id.is_empty() {
            return Err(AppError::Unauthorized(anyhow::anyhow!("OAuth token invalid")));
        }

        Ok(OAuthIdentity {
            remote_user_id: body.data.user_id,
            scopes: body.data.scopes,
            metadata: body.data.metadata,
        })
    }
}

/// Accepts tokens from a fixed table.
#[derive(Clone, Default)]
pub struct MockOAuthValidator {
    tokens: Arc<Mutex<HashMap<String, String>>>,
}

impl MockOAuthValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `app_token` will validate as `remote_user_id`.
    pub fn accept(&self, app_token: &str, remote_user_id: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(app_token.to_string(), remote_user_id.to_string());
    }
}

#[async_trait]
impl OAuthValidator for MockOAuthValidator {
    async fn validate_token(&self, app_token: &str) -> Result<OAuthIdentity, AppError> {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(app_token) {
            Some(user_id) => Ok(OAuthIdentity {
                remote_user_id: user_id.clone(),
                ..Default::default()
            }),
            None => Err(AppError::Unauthorized(anyhow::anyhow!("OAuth token invalid"))),
        }
    }
}
