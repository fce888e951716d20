//! One-time codes proving control of a phone number or email address.
//!
//! Only the Argon2 hash of a code is stored. A code validates at most once and
//! never after its expiry; a wrong code and a missing or expired one fail with
//! the same error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{OtpConfig, MIN_OTP_VALIDITY};
use crate::db::{execute_tx, CredentialStore, StoreTx, TxBody};
use crate::models::{Channel, LoginType, VerificationCode};
use crate::services::email::Mailer;
use crate::services::sms::SmsProvider;
use crate::utils::clock::Clock;
use crate::utils::normalize::IdentityNormalizer;
use crate::utils::password::{hash_secret, verify_secret, PasswordHashString};
use crate::utils::{random, with_deadline};

/// Placeholder replaced by the code when a message is rendered.
pub const CODE_PLACEHOLDER: &str = "{code}";

const INVALID_CODE: &str = "invalid verification code";

fn invalid_code() -> AppError {
    AppError::Unauthorized(anyhow::anyhow!(INVALID_CODE))
}

/// Message text with exactly one `{code}` slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    before: String,
    after: String,
}

impl MessageTemplate {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let Some((before, after)) = raw.split_once(CODE_PLACEHOLDER) else {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "message template must contain {}",
                CODE_PLACEHOLDER
            )));
        };

        if before.contains(['{', '}']) || after.contains(['{', '}']) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "message template may contain exactly one {} and no other braces",
                CODE_PLACEHOLDER
            )));
        }

        Ok(Self {
            before: before.to_string(),
            after: after.to_string(),
        })
    }

    pub fn render(&self, code: &str) -> String {
        format!("{}{}{}", self.before, code, self.after)
    }
}

/// Why a code is being sent; picks the message template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePurpose {
    Verify,
    ResetPassword,
}

#[derive(Debug, Clone)]
struct Templates {
    sms_verify: MessageTemplate,
    sms_reset: MessageTemplate,
    email_verify_subject: String,
    email_verify: MessageTemplate,
    email_reset_subject: String,
    email_reset: MessageTemplate,
}

impl Templates {
    fn from_config(config: &OtpConfig) -> Result<Self, AppError> {
        Ok(Self {
            sms_verify: MessageTemplate::parse(&config.sms_verify_template)
                .map_err(|e| e.context("sms verify template"))?,
            sms_reset: MessageTemplate::parse(&config.sms_reset_template)
                .map_err(|e| e.context("sms reset template"))?,
            email_verify_subject: config.email_verify_subject.clone(),
            email_verify: MessageTemplate::parse(&config.email_verify_template)
                .map_err(|e| e.context("email verify template"))?,
            email_reset_subject: config.email_reset_subject.clone(),
            email_reset: MessageTemplate::parse(&config.email_reset_template)
                .map_err(|e| e.context("email reset template"))?,
        })
    }

    fn pick(&self, channel: Channel, purpose: CodePurpose) -> (Option<&str>, &MessageTemplate) {
        match (channel, purpose) {
            (Channel::Phone, CodePurpose::Verify) => (None, &self.sms_verify),
            (Channel::Phone, CodePurpose::ResetPassword) => (None, &self.sms_reset),
            (Channel::Email, CodePurpose::Verify) => {
                (Some(&self.email_verify_subject), &self.email_verify)
            }
            (Channel::Email, CodePurpose::ResetPassword) => {
                (Some(&self.email_reset_subject), &self.email_reset)
            }
        }
    }
}

/// The outbound message clients.
#[derive(Clone)]
pub struct Notifiers {
    pub sms: Arc<dyn SmsProvider>,
    pub mailer: Arc<dyn Mailer>,
}

impl Notifiers {
    pub fn new(sms: Arc<dyn SmsProvider>, mailer: Arc<dyn Mailer>) -> Self {
        Self { sms, mailer }
    }

    pub fn is_configured(&self, channel: Channel) -> bool {
        match channel {
            Channel::Phone => self.sms.is_configured(),
            Channel::Email => self.mailer.is_configured(),
        }
    }
}

/// A rendered message waiting to be sent. Carries the plaintext code and
/// must never be logged.
#[derive(Clone)]
pub struct PendingMessage {
    pub channel: Channel,
    pub address: String,
    subject: Option<String>,
    body: String,
}

pub struct VerificationService {
    store: Arc<dyn CredentialStore>,
    notifiers: Notifiers,
    normalizer: Arc<IdentityNormalizer>,
    clock: Arc<dyn Clock>,
    validity: chrono::Duration,
    templates: Templates,
    dispatch_deadline: Duration,
    tx_retry: RetryConfig,
}

impl VerificationService {
    /// Fails with a configuration error when the validity is under a minute
    /// or a template is malformed.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        notifiers: Notifiers,
        clock: Arc<dyn Clock>,
        config: &OtpConfig,
    ) -> Result<Self, AppError> {
        if config.validity < MIN_OTP_VALIDITY {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "verification code validity must be at least {} seconds",
                MIN_OTP_VALIDITY.as_secs()
            )));
        }

        let validity = chrono::Duration::from_std(config.validity)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("invalid code validity: {}", e)))?;

        Ok(Self {
            store,
            notifiers,
            normalizer: Arc::new(IdentityNormalizer::default()),
            clock,
            validity,
            templates: Templates::from_config(config)?,
            dispatch_deadline: Duration::from_secs(15),
            tx_retry: RetryConfig::default(),
        })
    }

    pub fn with_normalizer(mut self, normalizer: Arc<IdentityNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_dispatch_deadline(mut self, deadline: Duration) -> Self {
        self.dispatch_deadline = deadline;
        self
    }

    pub fn with_tx_retry(mut self, retry: RetryConfig) -> Self {
        self.tx_retry = retry;
        self
    }

    pub fn channel_available(&self, channel: Channel) -> bool {
        self.notifiers.is_configured(channel)
    }

    fn generate(channel: Channel) -> String {
        match channel {
            Channel::Phone => random::numeric_code(random::NUMERIC_CODE_LEN),
            Channel::Email => random::url_safe_token(random::EMAIL_TOKEN_BYTES),
        }
    }

    /// Persists a fresh code inside `tx` and returns the rendered message
    /// without sending it.
    pub async fn stage_code_in(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
        address: &str,
        channel: Channel,
        purpose: CodePurpose,
    ) -> Result<PendingMessage, AppError> {
        let code = Self::generate(channel);
        let code_hash = hash_secret(&code)?;
        let now = self.clock.now();

        let record = VerificationCode::new(
            user_id,
            address.to_string(),
            channel,
            code_hash.into_string(),
            now,
            now + self.validity,
        );
        tx.insert_code(&record)
            .await
            .map_err(|e| e.context("store verification code"))?;

        let (subject, template) = self.templates.pick(channel, purpose);
        Ok(PendingMessage {
            channel,
            address: address.to_string(),
            subject: subject.map(str::to_string),
            body: template.render(&code),
        })
    }

    /// Sends a staged message. Provider errors come back unchanged.
    pub async fn dispatch(&self, message: &PendingMessage) -> Result<(), AppError> {
        let send = async {
            match message.channel {
                Channel::Phone => self.notifiers.sms.send(&message.address, &message.body).await,
                Channel::Email => {
                    let subject = message.subject.as_deref().unwrap_or_default();
                    self.notifiers
                        .mailer
                        .send(&message.address, subject, &message.body)
                        .await
                }
            }
        };

        with_deadline(self.dispatch_deadline, "dispatch verification code", send).await?;
        tracing::info!(channel = message.channel.as_str(), "Verification code dispatched");
        Ok(())
    }

    /// Issues and sends a code as part of an enclosing unit of work. A send
    /// failure fails the unit of work.
    pub async fn issue_code_in(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
        address: &str,
        channel: Channel,
        purpose: CodePurpose,
    ) -> Result<(), AppError> {
        let message = self
            .stage_code_in(tx, user_id, address, channel, purpose)
            .await?;
        self.dispatch(&message).await
    }

    /// Sends a fresh verification code to one of the user's own bindings.
    #[tracing::instrument(skip(self, address))]
    pub async fn issue_code(
        &self,
        user_id: Uuid,
        address: &str,
        channel: Channel,
    ) -> Result<(), AppError> {
        let address = self.normalize(channel, address)?;

        let bound = self.store.binding(channel.login_type(), user_id).await?;
        if bound.as_ref().map(|b| b.value.as_str()) != Some(address.as_str()) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "{} is not bound to this user",
                channel.login_type()
            )));
        }

        self.issue(user_id, &address, channel, CodePurpose::Verify)
            .await
    }

    fn normalize(&self, channel: Channel, address: &str) -> Result<String, AppError> {
        self.normalizer.identifier(channel.login_type(), address)
    }

    async fn issue(
        &self,
        user_id: Uuid,
        address: &str,
        channel: Channel,
        purpose: CodePurpose,
    ) -> Result<(), AppError> {
        let body = IssueCode {
            engine: self,
            user_id,
            address,
            channel,
            purpose,
        };
        execute_tx(self.store.as_ref(), &self.tx_retry, &body).await
    }

    /// Finds the newest live code for (user, channel, address) and checks the
    /// submitted value against it. Does not consume the code.
    pub async fn check_code(
        &self,
        user_id: Uuid,
        address: &str,
        channel: Channel,
        submitted: &str,
    ) -> Result<VerificationCode, AppError> {
        let address = self.normalize(channel, address)?;
        let now = self.clock.now();
        let code = self
            .store
            .latest_unused_code(user_id, channel, &address, now)
            .await?
            .ok_or_else(invalid_code)?;

        match verify_secret(submitted, &PasswordHashString::new(code.code_hash.clone())) {
            Ok(()) => Ok(code),
            Err(e) if e.is_auth() => Err(invalid_code()),
            Err(e) => Err(e),
        }
    }

    /// Marks `code` used and its binding verified. Fails if another caller
    /// consumed the code first.
    pub async fn consume_in(
        &self,
        tx: &mut dyn StoreTx,
        code: &VerificationCode,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if !code.is_valid_at(now) {
            return Err(invalid_code());
        }
        tx.mark_code_used(code.channel, code.id)
            .await
            .map_err(|e| if e.is_auth() { invalid_code() } else { e })?;
        tx.set_binding_verified(code.channel.login_type(), code.user_id, &code.address, now)
            .await
    }

    #[tracing::instrument(skip(self, address, submitted))]
    pub async fn verify_code(
        &self,
        user_id: Uuid,
        address: &str,
        channel: Channel,
        submitted: &str,
    ) -> Result<(), AppError> {
        let code = self.check_code(user_id, address, channel, submitted).await?;
        let body = ConsumeCode { engine: self, code: &code };
        execute_tx(self.store.as_ref(), &self.tx_retry, &body).await?;

        tracing::info!(user_id = %user_id, "Verification code accepted");
        Ok(())
    }

    /// Sends a reset code to the phone or email bound to `identifier`.
    #[tracing::instrument(skip(self, identifier))]
    pub async fn send_pass_reset_code(
        &self,
        login_type: LoginType,
        identifier: &str,
    ) -> Result<(), AppError> {
        let channel = Channel::from_login_type(login_type).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "password reset codes can only be sent to a phone or email"
            ))
        })?;

        let address = self.normalizer.identifier(login_type, identifier)?;
        let user_id = self.store.user_id_by_identifier(login_type, &address).await?;

        self.issue(user_id, &address, channel, CodePurpose::ResetPassword)
            .await
    }
}

struct IssueCode<'a> {
    engine: &'a VerificationService,
    user_id: Uuid,
    address: &'a str,
    channel: Channel,
    purpose: CodePurpose,
}

#[async_trait]
impl<'a> TxBody for IssueCode<'a> {
    type Output = ();

    async fn run(&self, tx: &mut dyn StoreTx) -> Result<(), AppError> {
        self.engine
            .issue_code_in(tx, self.user_id, self.address, self.channel, self.purpose)
            .await
    }
}

struct ConsumeCode<'a> {
    engine: &'a VerificationService,
    code: &'a VerificationCode,
}

#[async_trait]
impl<'a> TxBody for ConsumeCode<'a> {
    type Output = ();

    async fn run(&self, tx: &mut dyn StoreTx) -> Result<(), AppError> {
        let now = self.engine.clock.now();
        self.engine.consume_in(tx, self.code, now).await
    }
}
