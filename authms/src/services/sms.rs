use async_trait::async_trait;
use reqwest::Client;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::TwilioConfig;

/// Outbound text messages.
#[async_trait]
pub trait SmsProvider: Send + Sync {
    async fn send(&self, to_phone: &str, body: &str) -> Result<(), AppError>;

    /// False when no provider is configured and every send would fail
    /// `NotImplemented`.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Twilio Messages API client.
#[derive(Clone)]
pub struct TwilioSms {
    client: Client,
    account_sid: String,
    auth_token: String,
    sender_phone: String,
}

impl TwilioSms {
    pub fn new(config: &TwilioConfig, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to build SMS client: {}", e)))?;

        tracing::info!("SMS service initialized with Twilio");

        Ok(Self {
            client,
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            sender_phone: config.sender_phone.clone(),
        })
    }
}

#[async_trait]
impl SmsProvider for TwilioSms {
    async fn send(&self, to_phone: &str, body: &str) -> Result<(), AppError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );

        let mut form_body: HashMap<&str, &str> = HashMap::new();
        form_body.insert("To", to_phone);
        form_body.insert("From", &self.sender_phone);
        form_body.insert("Body", body);

        let response = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form_body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Request to Twilio failed");
                AppError::InternalError(anyhow::anyhow!("Error sending SMS: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %error_body, "Twilio returned an error");
            return Err(AppError::InternalError(anyhow::anyhow!(
                "Twilio returned an error ({})",
                status
            )));
        }

        tracing::info!("SMS sent successfully");
        Ok(())
    }
}

/// Stands in when no SMS provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotConfiguredSms;

#[async_trait]
impl SmsProvider for NotConfiguredSms {
    async fn send(&self, _to_phone: &str, _body: &str) -> Result<(), AppError> {
        Err(AppError::NotImplemented(anyhow::anyhow!(
            "SMS notifications are not configured"
        )))
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// Records every message instead of sending it.
#[derive(Clone, Default)]
pub struct MockSms {
    sent: Arc<Mutex<Vec<(String, String)>>>,
    fail: Arc<Mutex<Option<String>>>,
}

impl MockSms {
    pub fn new() -> Self {
        Self::default()
    }

    /// (to, body) pairs in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Makes every following send fail with `reason`; `None` restores delivery.
    pub fn fail_with(&self, reason: Option<&str>) {
        *self.fail.lock().unwrap_or_else(|e| e.into_inner()) = reason.map(str::to_string);
    }
}

#[async_trait]
impl SmsProvider for MockSms {
    async fn send(&self, to_phone: &str, body: &str) -> Result<(), AppError> {
        if let Some(reason) = self.fail.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(AppError::InternalError(anyhow::anyhow!(reason)));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((to_phone.to_string(), body.to_string()));
        Ok(())
    }
}
