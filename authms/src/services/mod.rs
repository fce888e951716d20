//! Services layer for authms.
//!
//! The engines (registration, verification, sessions, token GC) and the
//! outbound clients they depend on.

pub mod email;
pub mod gc;
pub mod guard;
pub mod history;
mod jwt;
pub mod oauth;
pub mod registration;
pub mod session;
pub mod sms;
mod tokens;
pub mod verification;

pub use email::{Mailer, MockMailer, NotConfiguredMailer, SentEmail, SmtpMailer};
pub use gc::{GcHandle, GcNotifier, TokenGc, ALREADY_RUNNING};
pub use guard::{ApiCredentials, ApiGuard, API_KEY_LEN};
pub use history::HistoryRecorder;
pub use jwt::JwtService;
pub use oauth::{
    FacebookValidator, MockOAuthValidator, OAuthIdentity, OAuthRegistry, OAuthValidator, FACEBOOK,
};
pub use registration::{LoggedIn, RegistrationDeps, RegistrationService, RegistrationSettings};
pub use session::SessionService;
pub use sms::{MockSms, NotConfiguredSms, SmsProvider, TwilioSms};
pub use tokens::TokenRepository;
pub use verification::{
    CodePurpose, MessageTemplate, Notifiers, PendingMessage, VerificationService,
};
