pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod utils;

use service_core::error::AppError;
use std::sync::Arc;

use crate::config::{AuthConfig, TokenVariant};
use crate::db::{CredentialStore, TokenStore};
use crate::services::{
    ApiGuard, FacebookValidator, HistoryRecorder, Mailer, NotConfiguredMailer, NotConfiguredSms,
    Notifiers, OAuthRegistry, RegistrationDeps, RegistrationService, RegistrationSettings,
    SessionService, SmsProvider, SmtpMailer, TokenGc, TokenRepository, TwilioSms,
    VerificationService, FACEBOOK,
};
use crate::utils::clock::Clock;
use crate::utils::normalize::IdentityNormalizer;

/// Storage, clients and clock the engines are built on.
pub struct Components {
    pub credentials: Arc<dyn CredentialStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub notifiers: Notifiers,
    pub oauth: OAuthRegistry,
    pub clock: Arc<dyn Clock>,
}

/// The wired engines. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AuthConfig>,
    pub guard: ApiGuard,
    pub registration: Arc<RegistrationService>,
    pub verification: Arc<VerificationService>,
    pub sessions: Arc<SessionService>,
    pub history: HistoryRecorder,
    /// Present only for persisted tokens; signed ones leave nothing to collect.
    pub gc: Option<TokenGc>,
}

impl AppState {
    pub fn build(config: AuthConfig, components: Components) -> Result<Self, AppError> {
        let Components {
            credentials,
            tokens,
            notifiers,
            oauth,
            clock,
        } = components;

        let normalizer = Arc::new(IdentityNormalizer::new(
            &config.registration.allowed_email_domains,
        ));

        let guard = ApiGuard::new(credentials.clone(), config.security.master_api_key.clone())
            .with_clock(clock.clone());

        let verification = Arc::new(
            VerificationService::new(credentials.clone(), notifiers, clock.clone(), &config.otp)?
                .with_normalizer(normalizer.clone())
                .with_dispatch_deadline(config.deadlines.dispatch)
                .with_tx_retry(config.tx_retry.clone()),
        );

        let (gc, repository) = match config.session.variant {
            TokenVariant::Persisted => {
                let gc = TokenGc::new(tokens.clone(), clock.clone(), config.gc.short_interval);
                let repository = TokenRepository::new(tokens, gc.notifier());
                (Some(gc), Some(repository))
            }
            TokenVariant::Signed => (None, None),
        };
        let sessions = Arc::new(SessionService::new(
            &config.session,
            credentials.clone(),
            repository,
            clock.clone(),
        )?);

        let history = HistoryRecorder::new(credentials.clone(), clock.clone());

        let registration = Arc::new(RegistrationService::new(
            RegistrationDeps {
                store: credentials,
                guard: guard.clone(),
                normalizer,
                verification: verification.clone(),
                sessions: sessions.clone(),
                oauth: Arc::new(oauth),
                history: history.clone(),
                clock,
            },
            RegistrationSettings::from_config(&config),
        ));

        Ok(Self {
            config: Arc::new(config),
            guard,
            registration,
            verification,
            sessions,
            history,
            gc,
        })
    }
}

/// Real SMS and mail clients where configured; the rest answer
/// NotImplemented.
pub fn notifiers_from_config(config: &AuthConfig) -> Result<Notifiers, AppError> {
    let sms: Arc<dyn SmsProvider> = match &config.twilio {
        Some(twilio) => Arc::new(TwilioSms::new(twilio, config.deadlines.dispatch)?),
        None => {
            tracing::warn!("Twilio not configured - SMS verification disabled");
            Arc::new(NotConfiguredSms)
        }
    };

    let mailer: Arc<dyn Mailer> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp, config.deadlines.dispatch)?),
        None => {
            tracing::warn!("SMTP not configured - email verification disabled");
            Arc::new(NotConfiguredMailer)
        }
    };

    Ok(Notifiers::new(sms, mailer))
}

pub fn oauth_from_config(config: &AuthConfig) -> Result<OAuthRegistry, AppError> {
    let mut registry = OAuthRegistry::new();
    if let Some(facebook) = &config.facebook {
        registry = registry.with_provider(
            FACEBOOK,
            Arc::new(FacebookValidator::new(facebook, config.deadlines.oauth)?),
        );
    }
    Ok(registry)
}
