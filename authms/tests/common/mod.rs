//! Test helper module for authms integration tests.
//!
//! Wires the engines over the in-memory store with recording SMS, mail and
//! OAuth doubles and a clock the test controls.

#![allow(dead_code)]

use authms::{
    config::{
        AuthConfig, DatabaseConfig, DeadlineConfig, DispatchMode, Environment, GcConfig,
        OtpConfig, RegistrationConfig, SecurityConfig, SessionConfig, TokenVariant,
    },
    db::{CredentialStore, MemoryStore},
    models::{Group, LoginType, User, GROUP_ADMIN},
    services::{
        ApiCredentials, MockMailer, MockOAuthValidator, MockSms, Notifiers, OAuthRegistry,
        FACEBOOK,
    },
    utils::{
        clock::{Clock, ManualClock},
        Password,
    },
    AppState, Components,
};
use service_core::retry::RetryConfig;
use std::sync::Arc;
use std::time::Duration;

pub const MASTER_KEY: &str = "test-master-key";
pub const EMAIL_DOMAIN: &str = "example.com";
pub const PASSWORD: &str = "correct horse battery";

pub fn test_config() -> AuthConfig {
    AuthConfig {
        common: service_core::config::Config {
            log_level: "error".to_string(),
            otlp_endpoint: None,
        },
        environment: Environment::Dev,
        service_name: "authms-test".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        database: DatabaseConfig {
            url: String::new(),
            max_connections: 1,
            min_connections: 1,
        },
        session: SessionConfig::default(),
        gc: GcConfig::default(),
        otp: OtpConfig {
            sms_verify_template: "{code}".to_string(),
            sms_reset_template: "{code}".to_string(),
            email_verify_template: "{code}".to_string(),
            email_reset_template: "{code}".to_string(),
            ..OtpConfig::default()
        },
        registration: RegistrationConfig {
            allowed_email_domains: vec![EMAIL_DOMAIN.to_string()],
            ..RegistrationConfig::default()
        },
        security: SecurityConfig {
            master_api_key: MASTER_KEY.to_string(),
        },
        deadlines: DeadlineConfig::default(),
        tx_retry: RetryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..RetryConfig::default()
        },
        twilio: None,
        smtp: None,
        facebook: None,
    }
}

/// Engines plus handles on every test double behind them.
pub struct TestApp {
    pub state: AppState,
    pub store: MemoryStore,
    pub sms: MockSms,
    pub mailer: MockMailer,
    pub oauth: MockOAuthValidator,
    pub clock: Arc<ManualClock>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AuthConfig) -> Self {
        let clock = Arc::new(ManualClock::default());
        let engine_clock: Arc<dyn Clock> = clock.clone();
        let store = MemoryStore::with_clock(engine_clock.clone());
        let sms = MockSms::new();
        let mailer = MockMailer::new();
        let oauth = MockOAuthValidator::new();

        let state = AppState::build(
            config,
            Components {
                credentials: Arc::new(store.clone()),
                tokens: Arc::new(store.clone()),
                notifiers: Notifiers::new(Arc::new(sms.clone()), Arc::new(mailer.clone())),
                oauth: OAuthRegistry::new().with_provider(FACEBOOK, Arc::new(oauth.clone())),
                clock: engine_clock,
            },
        )
        .expect("failed to build app state");

        Self {
            state,
            store,
            sms,
            mailer,
            oauth,
            clock,
        }
    }

    pub fn creds(&self) -> ApiCredentials {
        ApiCredentials::new("test-client", MASTER_KEY)
    }

    pub fn password() -> Password {
        Password::new(PASSWORD)
    }

    pub async fn register(&self, login_type: LoginType, identifier: &str) -> User {
        self.state
            .registration
            .register_self(&self.creds(), login_type, "individual", identifier, &Self::password())
            .await
            .expect("registration failed")
    }

    /// Body of the last SMS sent; templates render the bare code.
    pub fn last_sms_code(&self) -> Option<String> {
        self.sms.sent().last().map(|(_, body)| body.clone())
    }

    pub fn last_email_code(&self) -> Option<String> {
        self.mailer.sent().last().map(|m| m.body.clone())
    }

    /// Registers a username account, puts it in the admin group and logs it
    /// in. Returns the session token.
    pub async fn admin_token(&self, username: &str) -> String {
        let user = self.register(LoginType::Username, username).await;
        let admin = self.admin_group().await;

        let mut tx = self.store.begin().await.expect("begin");
        tx.add_user_to_group(user.id, admin.id)
            .await
            .expect("add to admin group");
        tx.commit().await.expect("commit");

        self.state
            .registration
            .login(&self.creds(), LoginType::Username, username, &Self::password(), "admin-device")
            .await
            .expect("admin login failed")
            .token
            .token
    }

    pub async fn admin_group(&self) -> Group {
        match self.store.group_by_name(GROUP_ADMIN).await {
            Ok(group) => group,
            Err(_) => {
                let group = Group::new(GROUP_ADMIN, 3, self.clock.now()).expect("admin group");
                self.store.insert_group(&group).await.expect("insert admin group");
                group
            }
        }
    }
}

pub fn signed_config() -> AuthConfig {
    AuthConfig {
        session: SessionConfig {
            variant: TokenVariant::Signed,
            secret: "integration-secret".to_string(),
            validity: Duration::from_secs(3600),
        },
        ..test_config()
    }
}

pub fn after_commit_config() -> AuthConfig {
    let mut config = test_config();
    config.registration.dispatch_mode = DispatchMode::AfterCommit;
    config
}
