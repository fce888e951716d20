//! Account registration, identity linking and credential changes.
//!
//! Every account is created in one unit of work: the user row, its group
//! membership, each identifier binding and, for phone and email, a fresh
//! verification code. A duplicate identifier is detected by the store's
//! unique constraint and rolls the whole unit back, so a failed registration
//! never leaves an orphan user.

use async_trait::async_trait;
use service_core::error::AppError;
use service_core::retry::{retry_async, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{AuthConfig, DispatchMode};
use crate::db::{execute_tx, load_user, CredentialStore, StoreTx, TxBody};
use crate::models::{
    default_access_level, Binding, Channel, DeviceBinding, Group, HistoryAction, IssuedToken,
    LoginType, User, UserRecord, UserType, UserTypeName, VerificationCode, GROUP_ADMIN,
    GROUP_PUBLIC,
};
use crate::services::guard::{ApiCredentials, ApiGuard};
use crate::services::history::HistoryRecorder;
use crate::services::oauth::{OAuthIdentity, OAuthRegistry, FACEBOOK};
use crate::services::session::SessionService;
use crate::services::verification::{CodePurpose, PendingMessage, VerificationService};
use crate::utils::clock::Clock;
use crate::utils::normalize::IdentityNormalizer;
use crate::utils::password::{hash_password, verify_password, Password, PasswordHashString};
use crate::utils::{random, with_deadline};

/// Length of the password generated for accounts created by an admin.
pub const GENERATED_PASSWORD_LEN: usize = 32;

const INVALID_CREDENTIALS: &str = "invalid username/password combination";

fn invalid_credentials() -> AppError {
    AppError::Unauthorized(anyhow::anyhow!(INVALID_CREDENTIALS))
}

fn forbidden(reason: &str) -> AppError {
    AppError::Forbidden(anyhow::anyhow!("{}", reason))
}

/// Behaviour switches for the registration engine.
#[derive(Debug, Clone)]
pub struct RegistrationSettings {
    pub allow_self_reg: bool,
    pub dispatch_mode: DispatchMode,
    pub tx_retry: RetryConfig,
    /// Retry applied to codes sent after commit.
    pub dispatch_retry: RetryConfig,
    pub registration_deadline: Duration,
    pub oauth_deadline: Duration,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            allow_self_reg: true,
            dispatch_mode: DispatchMode::InTransaction,
            tx_retry: RetryConfig::default(),
            dispatch_retry: RetryConfig::quick(),
            registration_deadline: Duration::from_secs(30),
            oauth_deadline: Duration::from_secs(10),
        }
    }
}

impl RegistrationSettings {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            allow_self_reg: config.registration.allow_self_reg,
            dispatch_mode: config.registration.dispatch_mode,
            tx_retry: config.tx_retry.clone(),
            dispatch_retry: RetryConfig::quick(),
            registration_deadline: config.deadlines.registration,
            oauth_deadline: config.deadlines.oauth,
        }
    }
}

/// Collaborators the engine is wired with.
#[derive(Clone)]
pub struct RegistrationDeps {
    pub store: Arc<dyn CredentialStore>,
    pub guard: ApiGuard,
    pub normalizer: Arc<IdentityNormalizer>,
    pub verification: Arc<VerificationService>,
    pub sessions: Arc<SessionService>,
    pub oauth: Arc<OAuthRegistry>,
    pub history: HistoryRecorder,
    pub clock: Arc<dyn Clock>,
}

/// A user together with the session just opened for them.
#[derive(Debug, Clone)]
pub struct LoggedIn {
    pub user: User,
    pub token: IssuedToken,
}

/// Whether a new account is being created by its owner or by an admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    SelfService,
    Admin,
}

/// Everything a new account is made of, resolved before the unit of work.
struct NewAccount {
    user_type_id: Uuid,
    group_id: Uuid,
    password_hash: Option<String>,
    bindings: Vec<(LoginType, String)>,
    device_id: Option<String>,
    /// Channels a verification code goes out on.
    notify: Vec<Channel>,
}

pub struct RegistrationService {
    store: Arc<dyn CredentialStore>,
    guard: ApiGuard,
    normalizer: Arc<IdentityNormalizer>,
    verification: Arc<VerificationService>,
    sessions: Arc<SessionService>,
    oauth: Arc<OAuthRegistry>,
    history: HistoryRecorder,
    clock: Arc<dyn Clock>,
    settings: RegistrationSettings,
}

impl RegistrationService {
    pub fn new(deps: RegistrationDeps, settings: RegistrationSettings) -> Self {
        Self {
            store: deps.store,
            guard: deps.guard,
            normalizer: deps.normalizer,
            verification: deps.verification,
            sessions: deps.sessions,
            oauth: deps.oauth,
            history: deps.history,
            clock: deps.clock,
            settings,
        }
    }

    pub fn settings(&self) -> &RegistrationSettings {
        &self.settings
    }

    /// Creates an account for the caller with one identifier and a password.
    #[tracing::instrument(skip(self, creds, identifier, secret))]
    pub async fn register_self(
        &self,
        creds: &ApiCredentials,
        login_type: LoginType,
        user_type: &str,
        identifier: &str,
        secret: &Password,
    ) -> Result<User, AppError> {
        let result = with_deadline(
            self.settings.registration_deadline,
            "register",
            self.register_self_inner(creds, login_type, user_type, identifier, secret),
        )
        .await;
        self.finish_registration(result, None)
    }

    async fn register_self_inner(
        &self,
        creds: &ApiCredentials,
        login_type: LoginType,
        user_type: &str,
        identifier: &str,
        secret: &Password,
    ) -> Result<User, AppError> {
        self.guard.check(creds).await?;
        self.ensure_self_registration_open()?;

        if !login_type.is_password_comparable() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "{} accounts are registered through their OAuth provider",
                login_type
            )));
        }

        secret.validate()?;
        let value = self.normalizer.identifier(login_type, identifier)?;
        let user_type = self.resolve_user_type(user_type).await?;
        let group = self.group_by_name_or_create(GROUP_PUBLIC).await?;

        let account = NewAccount {
            user_type_id: user_type.id,
            group_id: group.id,
            password_hash: Some(hash_password(secret)?.into_string()),
            notify: self.notify_channels(login_type, Origin::SelfService)?,
            bindings: vec![(login_type, value)],
            device_id: None,
        };
        self.create_account(account).await
    }

    /// Creates an account whose phone number is bound to the device it was
    /// registered from.
    #[tracing::instrument(skip(self, creds, number, secret))]
    pub async fn register_self_by_locked_phone(
        &self,
        creds: &ApiCredentials,
        user_type: &str,
        device_id: &str,
        number: &str,
        secret: &Password,
    ) -> Result<User, AppError> {
        let result = with_deadline(
            self.settings.registration_deadline,
            "register by locked phone",
            self.register_locked_phone_inner(creds, user_type, device_id, number, secret),
        )
        .await;
        self.finish_registration(result, Some(device_id))
    }

    async fn register_locked_phone_inner(
        &self,
        creds: &ApiCredentials,
        user_type: &str,
        device_id: &str,
        number: &str,
        secret: &Password,
    ) -> Result<User, AppError> {
        self.guard.check(creds).await?;
        self.ensure_self_registration_open()?;

        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("device id cannot be empty")));
        }

        secret.validate()?;
        let phone = self.normalizer.phone(number)?;
        let user_type = self.resolve_user_type(user_type).await?;
        let group = self.group_by_name_or_create(GROUP_PUBLIC).await?;

        let account = NewAccount {
            user_type_id: user_type.id,
            group_id: group.id,
            password_hash: Some(hash_password(secret)?.into_string()),
            notify: self.notify_channels(LoginType::Phone, Origin::SelfService)?,
            bindings: vec![(LoginType::Phone, phone)],
            device_id: Some(device_id.to_string()),
        };
        self.create_account(account).await
    }

    /// Creates an account on behalf of someone else. The caller's session
    /// must carry the admin group; the new user gets a generated password and
    /// joins `group_id`.
    #[tracing::instrument(skip(self, creds, caller_token, identifier))]
    pub async fn register_other(
        &self,
        creds: &ApiCredentials,
        caller_token: &str,
        login_type: LoginType,
        user_type: &str,
        identifier: &str,
        group_id: Uuid,
    ) -> Result<User, AppError> {
        let result = with_deadline(
            self.settings.registration_deadline,
            "register other",
            self.register_other_inner(creds, caller_token, login_type, user_type, identifier, group_id),
        )
        .await;
        self.finish_registration(result, None)
    }

    async fn register_other_inner(
        &self,
        creds: &ApiCredentials,
        caller_token: &str,
        login_type: LoginType,
        user_type: &str,
        identifier: &str,
        group_id: Uuid,
    ) -> Result<User, AppError> {
        self.guard.check(creds).await?;
        let caller = self.authorize_caller(caller_token, None).await?;

        if !login_type.is_password_comparable() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "{} accounts are registered through their OAuth provider",
                login_type
            )));
        }

        let value = self.normalizer.identifier(login_type, identifier)?;
        let user_type = self.resolve_user_type(user_type).await?;
        let group = match self.store.group(group_id).await {
            Ok(group) => group,
            Err(e) if e.is_not_found() => {
                return Err(AppError::BadRequest(anyhow::anyhow!("group does not exist")))
            }
            Err(e) => return Err(e),
        };

        // Refuse before any write when the code could never be delivered.
        let notify = self.notify_channels(login_type, Origin::Admin)?;

        let password = Password::new(random::alphanumeric(GENERATED_PASSWORD_LEN));
        let account = NewAccount {
            user_type_id: user_type.id,
            group_id: group.id,
            password_hash: Some(hash_password(&password)?.into_string()),
            notify,
            bindings: vec![(login_type, value)],
            device_id: None,
        };
        let user = self.create_account(account).await?;

        tracing::info!(admin_id = %caller, user_id = %user.id, "Account registered by admin");
        Ok(user)
    }

    /// Self-registration through a third-party identity. The binding is
    /// verified from the start and the account has no password.
    #[tracing::instrument(skip(self, creds, app_token))]
    pub async fn register_oauth(
        &self,
        creds: &ApiCredentials,
        user_type: &str,
        provider: &str,
        app_token: &str,
    ) -> Result<User, AppError> {
        let result = with_deadline(
            self.settings.registration_deadline,
            "register oauth",
            self.register_oauth_inner(creds, user_type, provider, app_token),
        )
        .await;
        self.finish_registration(result, None)
    }

    async fn register_oauth_inner(
        &self,
        creds: &ApiCredentials,
        user_type: &str,
        provider: &str,
        app_token: &str,
    ) -> Result<User, AppError> {
        self.guard.check(creds).await?;
        self.ensure_self_registration_open()?;

        let user_type = self.resolve_user_type(user_type).await?;
        let (login_type, identity) = self.validate_oauth(provider, app_token).await?;
        let group = self.group_by_name_or_create(GROUP_PUBLIC).await?;

        let account = NewAccount {
            user_type_id: user_type.id,
            group_id: group.id,
            password_hash: None,
            notify: Vec::new(),
            bindings: vec![(login_type, identity.remote_user_id)],
            device_id: None,
        };
        self.create_account(account).await
    }

    /// Checks a password against the account bound to `identifier` and opens
    /// a session on success.
    #[tracing::instrument(skip(self, creds, identifier, secret))]
    pub async fn login(
        &self,
        creds: &ApiCredentials,
        login_type: LoginType,
        identifier: &str,
        secret: &Password,
        device_id: &str,
    ) -> Result<LoggedIn, AppError> {
        self.guard.check(creds).await?;

        if !login_type.is_password_comparable() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "{} logins go through the OAuth provider",
                login_type
            )));
        }

        let (user_id, result) = self
            .password_login(login_type, identifier, secret, device_id)
            .await;
        self.history
            .record_result(user_id, HistoryAction::Login, Some(device_id), &result);

        if result.is_ok() {
            metrics::counter!("authms_logins_total").increment(1);
        } else {
            metrics::counter!("authms_login_failures_total").increment(1);
        }
        result
    }

    async fn password_login(
        &self,
        login_type: LoginType,
        identifier: &str,
        secret: &Password,
        device_id: &str,
    ) -> (Option<Uuid>, Result<LoggedIn, AppError>) {
        // A malformed identifier can never be bound, so it reads as unknown.
        let value = match self.normalizer.identifier(login_type, identifier) {
            Ok(value) => value,
            Err(e) if e.is_client() => return (None, Err(invalid_credentials())),
            Err(e) => return (None, Err(e)),
        };

        let user_id = match self.store.user_id_by_identifier(login_type, &value).await {
            Ok(id) => id,
            Err(e) if e.is_not_found() => return (None, Err(invalid_credentials())),
            Err(e) => return (None, Err(e)),
        };

        let result = async {
            let record = self.store.user_record(user_id).await?;
            let hash = record.password_hash.ok_or_else(invalid_credentials)?;
            verify_password(secret, &PasswordHashString::new(hash))
                .map_err(|e| if e.is_auth() { invalid_credentials() } else { e })?;
            self.open_session(user_id, device_id).await
        }
        .await;

        (Some(user_id), result)
    }

    /// Opens a session for the account bound to a third-party identity.
    #[tracing::instrument(skip(self, creds, app_token))]
    pub async fn login_oauth(
        &self,
        creds: &ApiCredentials,
        provider: &str,
        app_token: &str,
        device_id: &str,
    ) -> Result<LoggedIn, AppError> {
        self.guard.check(creds).await?;

        let (login_type, identity) = self.validate_oauth(provider, app_token).await?;
        let user_id = match self
            .store
            .user_id_by_identifier(login_type, &identity.remote_user_id)
            .await
        {
            Ok(id) => id,
            Err(e) if e.is_not_found() => {
                self.history
                    .record(None, HistoryAction::Login, false, Some(device_id));
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "no account is registered for this {} identity",
                    login_type
                )));
            }
            Err(e) => return Err(e),
        };

        let result = self.open_session(user_id, device_id).await;
        self.history
            .record_result(Some(user_id), HistoryAction::Login, Some(device_id), &result);
        result
    }

    /// Adds or replaces one of `user_id`'s identifiers. The caller must be
    /// that user or an admin. Phone and email bindings start unverified and a
    /// fresh code is sent.
    #[tracing::instrument(skip(self, creds, token, identifier))]
    pub async fn update_identifier(
        &self,
        creds: &ApiCredentials,
        token: &str,
        user_id: Uuid,
        login_type: LoginType,
        identifier: &str,
    ) -> Result<User, AppError> {
        let result = self
            .update_identifier_inner(creds, token, user_id, login_type, identifier)
            .await;
        self.history
            .record_result(Some(user_id), HistoryAction::UpdateIdentifier, None, &result);
        result
    }

    async fn update_identifier_inner(
        &self,
        creds: &ApiCredentials,
        token: &str,
        user_id: Uuid,
        login_type: LoginType,
        identifier: &str,
    ) -> Result<User, AppError> {
        self.guard.check(creds).await?;
        self.authorize_caller(token, Some(user_id)).await?;

        if login_type == LoginType::Facebook {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "OAuth identities are linked through their provider"
            )));
        }

        let value = self.normalizer.identifier(login_type, identifier)?;
        let record = self.store.user_record(user_id).await?;
        if record.password_hash.is_none() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "set a password before adding a {} login",
                login_type
            )));
        }

        let notify = self.notify_channels(login_type, Origin::SelfService)?;
        let body = LinkIdentifier {
            engine: self,
            user_id,
            login_type,
            value: &value,
            notify: notify.first().copied(),
        };
        let pending = execute_tx(self.store.as_ref(), &self.settings.tx_retry, &body)
            .await
            .map_err(|e| e.context(format!("update {} identifier", login_type)))?;
        self.dispatch_after_commit(pending).await;

        tracing::info!(user_id = %user_id, login_type = %login_type, "Identifier updated");
        load_user(self.store.as_ref(), user_id).await
    }

    /// Changes a password after checking the current one.
    #[tracing::instrument(skip(self, creds, old_secret, new_secret))]
    pub async fn update_password(
        &self,
        creds: &ApiCredentials,
        user_id: Uuid,
        old_secret: &Password,
        new_secret: &Password,
    ) -> Result<(), AppError> {
        let result = async {
            self.guard.check(creds).await?;
            new_secret.validate()?;

            let record = self.store.user_record(user_id).await?;
            let hash = record.password_hash.ok_or_else(invalid_credentials)?;
            verify_password(old_secret, &PasswordHashString::new(hash))
                .map_err(|e| if e.is_auth() { invalid_credentials() } else { e })?;

            let body = ChangePassword {
                user_id,
                password_hash: hash_password(new_secret)?.into_string(),
                clock: self.clock.as_ref(),
                code: None,
                verification: self.verification.as_ref(),
            };
            execute_tx(self.store.as_ref(), &self.settings.tx_retry, &body).await
        }
        .await;

        self.history
            .record_result(Some(user_id), HistoryAction::UpdatePassword, None, &result);
        result
    }

    /// Sets a new password after proving control of a phone or email with a
    /// code from [`RegistrationService::send_pass_reset_code`]. The code is
    /// consumed in the same unit of work.
    #[tracing::instrument(skip(self, creds, address, code, new_secret))]
    pub async fn set_password(
        &self,
        creds: &ApiCredentials,
        user_id: Uuid,
        login_type: LoginType,
        address: &str,
        code: &str,
        new_secret: &Password,
    ) -> Result<(), AppError> {
        let result = async {
            self.guard.check(creds).await?;
            new_secret.validate()?;

            let channel = reset_channel(login_type)?;
            let address = self.normalizer.identifier(login_type, address)?;
            let code = self
                .verification
                .check_code(user_id, &address, channel, code)
                .await?;

            let body = ChangePassword {
                user_id,
                password_hash: hash_password(new_secret)?.into_string(),
                clock: self.clock.as_ref(),
                code: Some(&code),
                verification: self.verification.as_ref(),
            };
            execute_tx(self.store.as_ref(), &self.settings.tx_retry, &body).await
        }
        .await;

        self.history
            .record_result(Some(user_id), HistoryAction::ResetPassword, None, &result);
        result
    }

    /// Sends a password reset code to the phone or email bound to
    /// `identifier`.
    #[tracing::instrument(skip(self, creds, identifier))]
    pub async fn send_pass_reset_code(
        &self,
        creds: &ApiCredentials,
        login_type: LoginType,
        identifier: &str,
    ) -> Result<(), AppError> {
        self.guard.check(creds).await?;
        reset_channel(login_type)?;

        let result = self
            .verification
            .send_pass_reset_code(login_type, identifier)
            .await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, login_type = %login_type, "Password reset code not sent");
        }
        result
    }

    /// Checks a verification code and marks the binding verified.
    #[tracing::instrument(skip(self, creds, address, code))]
    pub async fn verify_identifier(
        &self,
        creds: &ApiCredentials,
        user_id: Uuid,
        login_type: LoginType,
        address: &str,
        code: &str,
    ) -> Result<User, AppError> {
        let result = async {
            self.guard.check(creds).await?;
            let channel = Channel::from_login_type(login_type).ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!("{} identifiers need no verification", login_type))
            })?;
            let address = self.normalizer.identifier(login_type, address)?;
            self.verification
                .verify_code(user_id, &address, channel, code)
                .await?;
            load_user(self.store.as_ref(), user_id).await
        }
        .await;

        self.history
            .record_result(Some(user_id), HistoryAction::Verification, None, &result);
        result
    }

    /// Looks up the account registered from `device_id`.
    pub async fn user_by_device(
        &self,
        creds: &ApiCredentials,
        device_id: &str,
    ) -> Result<User, AppError> {
        self.guard.check(creds).await?;
        let user_id = self.store.user_id_by_device(device_id.trim()).await?;
        load_user(self.store.as_ref(), user_id).await
    }

    fn ensure_self_registration_open(&self) -> Result<(), AppError> {
        if !self.settings.allow_self_reg {
            return Err(forbidden("registration closed to the public"));
        }
        Ok(())
    }

    /// Validates the caller's session. Passes when the caller holds the admin
    /// group, or is `owner` when one is given. Returns the caller's id.
    async fn authorize_caller(&self, token: &str, owner: Option<Uuid>) -> Result<Uuid, AppError> {
        if token.trim().is_empty() {
            return Err(AppError::Unauthorized(anyhow::anyhow!("session token required")));
        }

        let claims = self.sessions.validate(token).await.map_err(|e| {
            if e.is_auth() {
                forbidden("session token is not valid")
            } else {
                e
            }
        })?;

        if owner == Some(claims.user_id) {
            return Ok(claims.user_id);
        }

        let admin = self.group_by_name_or_create(GROUP_ADMIN).await?;
        if !SessionService::authorize(&claims, &admin) {
            tracing::warn!(caller_id = %claims.user_id, "Caller lacks the admin group");
            return Err(forbidden("caller is not an admin"));
        }
        Ok(claims.user_id)
    }

    async fn resolve_user_type(&self, name: &str) -> Result<UserType, AppError> {
        let name: UserTypeName = name.parse()?;
        self.user_type_by_name_or_create(name).await
    }

    async fn group_by_name_or_create(&self, name: &str) -> Result<Group, AppError> {
        match self.store.group_by_name(name).await {
            Ok(group) => return Ok(group),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let group = Group::new(name, default_access_level(name), self.clock.now())?;
        match self.store.insert_group(&group).await {
            Ok(()) => {
                tracing::info!(group = name, "Created group");
                Ok(group)
            }
            // Lost a creation race; the winner's row is the one to use.
            Err(e) if e.is_conflict() => self.store.group_by_name(name).await,
            Err(e) => Err(e.context(format!("create group {}", name))),
        }
    }

    async fn user_type_by_name_or_create(&self, name: UserTypeName) -> Result<UserType, AppError> {
        match self.store.user_type_by_name(name.as_str()).await {
            Ok(user_type) => return Ok(user_type),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let user_type = UserType {
            id: Uuid::new_v4(),
            name: name.as_str().to_string(),
            created_at: self.clock.now(),
        };
        match self.store.insert_user_type(&user_type).await {
            Ok(()) => Ok(user_type),
            Err(e) if e.is_conflict() => self.store.user_type_by_name(name.as_str()).await,
            Err(e) => Err(e.context(format!("create user type {}", name.as_str()))),
        }
    }

    /// Channels to send a code on for a new `login_type` binding. Self
    /// service skips an unconfigured provider; an admin call refuses it.
    fn notify_channels(&self, login_type: LoginType, origin: Origin) -> Result<Vec<Channel>, AppError> {
        let Some(channel) = Channel::from_login_type(login_type) else {
            return Ok(Vec::new());
        };

        if self.verification.channel_available(channel) {
            return Ok(vec![channel]);
        }

        match origin {
            Origin::SelfService => {
                tracing::warn!(channel = channel.as_str(), "Provider not configured, skipping verification code");
                Ok(Vec::new())
            }
            Origin::Admin => Err(AppError::NotImplemented(anyhow::anyhow!(
                "{} notifications are not configured",
                channel.as_str()
            ))),
        }
    }

    async fn validate_oauth(
        &self,
        provider: &str,
        app_token: &str,
    ) -> Result<(LoginType, OAuthIdentity), AppError> {
        let validator = self.oauth.get(provider)?;
        let login_type = oauth_login_type(provider)?;

        let identity = with_deadline(
            self.settings.oauth_deadline,
            "validate OAuth token",
            validator.validate_token(app_token),
        )
        .await?;
        if identity.remote_user_id.trim().is_empty() {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "OAuth provider returned no user id"
            )));
        }
        Ok((login_type, identity))
    }

    async fn create_account(&self, account: NewAccount) -> Result<User, AppError> {
        let body = CreateAccount {
            engine: self,
            account: &account,
        };
        let (user_id, pending) = execute_tx(self.store.as_ref(), &self.settings.tx_retry, &body)
            .await
            .map_err(|e| e.context("register account"))?;
        self.dispatch_after_commit(pending).await;

        load_user(self.store.as_ref(), user_id).await
    }

    /// Stages or sends a code for `channel` per the dispatch mode. Staged
    /// messages are returned for sending once the unit of work commits.
    async fn code_in(
        &self,
        tx: &mut dyn StoreTx,
        user_id: Uuid,
        address: &str,
        channel: Channel,
        pending: &mut Vec<PendingMessage>,
    ) -> Result<(), AppError> {
        match self.settings.dispatch_mode {
            DispatchMode::InTransaction => {
                self.verification
                    .issue_code_in(tx, user_id, address, channel, CodePurpose::Verify)
                    .await
            }
            DispatchMode::AfterCommit => {
                let message = self
                    .verification
                    .stage_code_in(tx, user_id, address, channel, CodePurpose::Verify)
                    .await?;
                pending.push(message);
                Ok(())
            }
        }
    }

    async fn dispatch_after_commit(&self, pending: Vec<PendingMessage>) {
        for message in &pending {
            let result = retry_async(
                &self.settings.dispatch_retry,
                "dispatch_verification_code",
                AppError::is_internal,
                || self.verification.dispatch(message),
            )
            .await;

            if let Err(e) = result {
                tracing::error!(
                    error = %e,
                    channel = message.channel.as_str(),
                    "Verification code dispatch failed after commit"
                );
            }
        }
    }

    async fn open_session(&self, user_id: Uuid, device_id: &str) -> Result<LoggedIn, AppError> {
        let user = load_user(self.store.as_ref(), user_id).await?;
        let token = self.sessions.issue(user.id, device_id, &user.groups).await?;
        tracing::info!(user_id = %user.id, "User logged in");
        Ok(LoggedIn { user, token })
    }

    fn finish_registration(
        &self,
        result: Result<User, AppError>,
        device_id: Option<&str>,
    ) -> Result<User, AppError> {
        let user_id = result.as_ref().ok().map(|u| u.id);
        self.history
            .record_result(user_id, HistoryAction::Registration, device_id, &result);

        match &result {
            Ok(user) => {
                metrics::counter!("authms_registrations_total").increment(1);
                tracing::info!(user_id = %user.id, "User registered");
            }
            Err(e) => {
                metrics::counter!("authms_registration_failures_total").increment(1);
                tracing::warn!(error = %e, "Registration failed");
            }
        }
        result
    }
}

fn oauth_login_type(provider: &str) -> Result<LoginType, AppError> {
    match provider.trim().to_lowercase().as_str() {
        FACEBOOK => Ok(LoginType::Facebook),
        other => Err(AppError::BadRequest(anyhow::anyhow!(
            "OAuth provider '{}' has no identifier binding",
            other
        ))),
    }
}

fn reset_channel(login_type: LoginType) -> Result<Channel, AppError> {
    Channel::from_login_type(login_type).ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!(
            "password reset codes can only be sent to a phone or email"
        ))
    })
}

struct CreateAccount<'a> {
    engine: &'a RegistrationService,
    account: &'a NewAccount,
}

#[async_trait]
impl<'a> TxBody for CreateAccount<'a> {
    type Output = (Uuid, Vec<PendingMessage>);

    async fn run(&self, tx: &mut dyn StoreTx) -> Result<Self::Output, AppError> {
        let account = self.account;
        let now = self.engine.clock.now();

        let record = UserRecord::new(
            account.user_type_id,
            account.password_hash.clone(),
            now,
        );
        tx.insert_user(&record).await?;
        tx.add_user_to_group(record.id, account.group_id).await?;

        for (login_type, value) in &account.bindings {
            let binding = Binding::new(record.id, *login_type, value.clone(), now);
            tx.insert_binding(*login_type, &binding).await?;
        }

        if let Some(device_id) = &account.device_id {
            let device = DeviceBinding {
                id: Uuid::new_v4(),
                user_id: record.id,
                device_id: device_id.clone(),
                created_at: now,
            };
            tx.insert_device(&device).await?;
        }

        let mut pending = Vec::new();
        for channel in &account.notify {
            let Some((_, address)) = account
                .bindings
                .iter()
                .find(|(lt, _)| *lt == channel.login_type())
            else {
                continue;
            };
            self.engine
                .code_in(tx, record.id, address, *channel, &mut pending)
                .await?;
        }

        Ok((record.id, pending))
    }
}

struct LinkIdentifier<'a> {
    engine: &'a RegistrationService,
    user_id: Uuid,
    login_type: LoginType,
    value: &'a str,
    notify: Option<Channel>,
}

#[async_trait]
impl<'a> TxBody for LinkIdentifier<'a> {
    type Output = Vec<PendingMessage>;

    async fn run(&self, tx: &mut dyn StoreTx) -> Result<Self::Output, AppError> {
        let now = self.engine.clock.now();
        let binding = Binding::new(self.user_id, self.login_type, self.value.to_string(), now);
        tx.upsert_binding(self.login_type, &binding).await?;

        let mut pending = Vec::new();
        if let Some(channel) = self.notify {
            self.engine
                .code_in(tx, self.user_id, self.value, channel, &mut pending)
                .await?;
        }
        Ok(pending)
    }
}

struct ChangePassword<'a> {
    user_id: Uuid,
    password_hash: String,
    clock: &'a dyn Clock,
    /// Reset code to consume alongside the change.
    code: Option<&'a VerificationCode>,
    verification: &'a VerificationService,
}

#[async_trait]
impl<'a> TxBody for ChangePassword<'a> {
    type Output = ();

    async fn run(&self, tx: &mut dyn StoreTx) -> Result<(), AppError> {
        let now = self.clock.now();
        if let Some(code) = self.code {
            self.verification.consume_in(tx, code, now).await?;
        }
        tx.update_password(self.user_id, &self.password_hash, now)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_login_type() {
        assert_eq!(oauth_login_type("Facebook").unwrap(), LoginType::Facebook);
        assert!(oauth_login_type("myspace").unwrap_err().is_client());
    }

    #[test]
    fn test_reset_channel_only_for_contact_channels() {
        assert_eq!(reset_channel(LoginType::Phone).unwrap(), Channel::Phone);
        assert_eq!(reset_channel(LoginType::Email).unwrap(), Channel::Email);
        assert!(reset_channel(LoginType::Username).is_err());
    }

    #[test]
    fn test_settings_default_dispatch_in_transaction() {
        let settings = RegistrationSettings::default();
        assert!(settings.allow_self_reg);
        assert_eq!(settings.dispatch_mode, DispatchMode::InTransaction);
    }
}
