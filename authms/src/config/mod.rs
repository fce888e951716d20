use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Shortest code lifetime accepted from configuration.
pub const MIN_OTP_VALIDITY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub session: SessionConfig,
    pub gc: GcConfig,
    pub otp: OtpConfig,
    pub registration: RegistrationConfig,
    pub security: SecurityConfig,
    pub deadlines: DeadlineConfig,
    pub tx_retry: RetryConfig,
    pub twilio: Option<TwilioConfig>,
    pub smtp: Option<SmtpConfig>,
    pub facebook: Option<FacebookConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Which credential [`crate::services::SessionService`] hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenVariant {
    /// Self-contained HS256 JWT.
    Signed,
    /// Opaque bearer value backed by the tokens table.
    Persisted,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub variant: TokenVariant,
    /// HMAC key for signed tokens.
    pub secret: String,
    pub validity: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            variant: TokenVariant::Persisted,
            secret: String::new(),
            validity: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Poll interval used while the token table is empty or a delete is in flight.
    pub short_interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            short_interval: Duration::from_secs(1),
        }
    }
}

/// Message templates carry exactly one `{code}` placeholder.
#[derive(Debug, Clone)]
pub struct OtpConfig {
    pub validity: Duration,
    pub sms_verify_template: String,
    pub sms_reset_template: String,
    pub email_verify_subject: String,
    pub email_verify_template: String,
    pub email_reset_subject: String,
    pub email_reset_template: String,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            validity: Duration::from_secs(15 * 60),
            sms_verify_template: "Your verification code is {code}".to_string(),
            sms_reset_template: "Your password reset code is {code}".to_string(),
            email_verify_subject: "Verify Your Email Address".to_string(),
            email_verify_template: "Use this token to verify your email address: {code}"
                .to_string(),
            email_reset_subject: "Reset Your Password".to_string(),
            email_reset_template: "Use this token to reset your password: {code}".to_string(),
        }
    }
}

/// When a verification message is sent relative to the registration commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Send inside the unit of work; a failed send rolls the account back.
    #[default]
    InTransaction,
    /// Commit first, then send with its own retries.
    AfterCommit,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in_transaction" | "intransaction" => Ok(DispatchMode::InTransaction),
            "after_commit" | "aftercommit" => Ok(DispatchMode::AfterCommit),
            _ => Err(format!("Invalid dispatch mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub allow_self_reg: bool,
    /// Email domains accepted by the normalizer. Empty accepts none.
    pub allowed_email_domains: Vec<String>,
    pub dispatch_mode: DispatchMode,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            allow_self_reg: true,
            allowed_email_domains: Vec::new(),
            dispatch_mode: DispatchMode::InTransaction,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub master_api_key: String,
}

#[derive(Debug, Clone)]
pub struct DeadlineConfig {
    pub registration: Duration,
    pub dispatch: Duration,
    pub oauth: Duration,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            registration: Duration::from_secs(30),
            dispatch: Duration::from_secs(15),
            oauth: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub sender_phone: String,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct FacebookConfig {
    pub app_id: String,
    pub app_secret: String,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let session_variant: TokenVariant =
            get_env("SESSION_TOKEN_VARIANT", Some("persisted"), false)?
                .parse()
                .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let config = AuthConfig {
            log_level: get_env("LOG_LEVEL", Some(&common_config.log_level), false)?,
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("authms"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            database: DatabaseConfig {
                url: get_env(
                    "DATABASE_URL",
                    Some("postgres://root@localhost:26257/authms?sslmode=disable"),
                    is_prod,
                )?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10")?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1")?,
            },
            session: SessionConfig {
                variant: session_variant,
                secret: get_env(
                    "SESSION_TOKEN_SECRET",
                    Some(""),
                    secret_required(environment, session_variant),
                )?,
                validity: Duration::from_secs(parse_env("SESSION_VALIDITY_SECONDS", "86400")?),
            },
            gc: GcConfig {
                short_interval: Duration::from_millis(parse_env("GC_SHORT_INTERVAL_MS", "1000")?),
            },
            otp: OtpConfig {
                validity: Duration::from_secs(parse_env("OTP_VALIDITY_SECONDS", "900")?),
                ..otp_templates_from_env()?
            },
            registration: RegistrationConfig {
                allow_self_reg: parse_env("AUTH_ALLOW_SELF_REG", "true")?,
                allowed_email_domains: get_env("AUTH_ALLOWED_EMAIL_DOMAINS", Some(""), false)?
                    .split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
                dispatch_mode: get_env("AUTH_DISPATCH_MODE", Some("in_transaction"), false)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            },
            security: SecurityConfig {
                master_api_key: get_env("MASTER_API_KEY", Some(""), is_prod)?,
            },
            deadlines: DeadlineConfig {
                registration: Duration::from_secs(parse_env("DEADLINE_REGISTRATION_SECONDS", "30")?),
                dispatch: Duration::from_secs(parse_env("DEADLINE_DISPATCH_SECONDS", "15")?),
                oauth: Duration::from_secs(parse_env("DEADLINE_OAUTH_SECONDS", "10")?),
            },
            tx_retry: RetryConfig::with_max_retries(parse_env("TX_MAX_RETRIES", "3")?),
            twilio: match optional_env("TWILIO_ACCOUNT_SID") {
                Some(account_sid) => Some(TwilioConfig {
                    account_sid,
                    auth_token: get_env("TWILIO_AUTH_TOKEN", None, is_prod)?,
                    sender_phone: get_env("TWILIO_SENDER_PHONE", None, is_prod)?,
                }),
                None => None,
            },
            smtp: match optional_env("SMTP_HOST") {
                Some(host) => {
                    let user = get_env("SMTP_USER", None, is_prod)?;
                    Some(SmtpConfig {
                        host,
                        port: parse_env("SMTP_PORT", "587")?,
                        from: get_env("SMTP_FROM", Some(&user), false)?,
                        password: get_env("SMTP_PASSWORD", None, is_prod)?,
                        user,
                    })
                }
                None => None,
            },
            facebook: match optional_env("FACEBOOK_APP_ID") {
                Some(app_id) => Some(FacebookConfig {
                    app_id,
                    app_secret: get_env("FACEBOOK_APP_SECRET", None, is_prod)?,
                }),
                None => None,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.otp.validity < MIN_OTP_VALIDITY {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "OTP_VALIDITY_SECONDS must be at least {} seconds",
                MIN_OTP_VALIDITY.as_secs()
            )));
        }

        if self.session.variant == TokenVariant::Signed && self.session.secret.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_TOKEN_SECRET is required for signed session tokens"
            )));
        }

        if self.session.validity.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_VALIDITY_SECONDS must be positive"
            )));
        }

        if self.gc.short_interval.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "GC_SHORT_INTERVAL_MS must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.master_api_key.is_empty() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "MASTER_API_KEY must not be empty in production"
                )));
            }

            if self.registration.allowed_email_domains.is_empty() {
                tracing::warn!("AUTH_ALLOWED_EMAIL_DOMAINS is empty - email identifiers will be rejected");
            }
        }

        Ok(())
    }
}

/// Only signed tokens are keyed; persisted ones are random and hashed.
fn secret_required(environment: Environment, variant: TokenVariant) -> bool {
    environment == Environment::Prod && variant == TokenVariant::Signed
}

fn otp_templates_from_env() -> Result<OtpConfig, AppError> {
    let defaults = OtpConfig::default();
    Ok(OtpConfig {
        validity: defaults.validity,
        sms_verify_template: get_env("SMS_VERIFY_TPL", Some(&defaults.sms_verify_template), false)?,
        sms_reset_template: get_env("SMS_RESET_PWD_TPL", Some(&defaults.sms_reset_template), false)?,
        email_verify_subject: get_env(
            "EMAIL_VERIFY_SUBJECT",
            Some(&defaults.email_verify_subject),
            false,
        )?,
        email_verify_template: get_env(
            "EMAIL_VERIFY_TPL",
            Some(&defaults.email_verify_template),
            false,
        )?,
        email_reset_subject: get_env(
            "EMAIL_RESET_PWD_SUBJECT",
            Some(&defaults.email_reset_subject),
            false,
        )?,
        email_reset_template: get_env(
            "EMAIL_RESET_PWD_TPL",
            Some(&defaults.email_reset_template),
            false,
        )?,
    })
}

/// Reads `key`. In production every key passed with `is_prod` set is required;
/// elsewhere a missing key falls back to `default`.
fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), false)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("invalid {}: {}", key, e)))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for TokenVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "signed" | "jwt" => Ok(TokenVariant::Signed),
            "persisted" | "opaque" => Ok(TokenVariant::Persisted),
            _ => Err(format!("Invalid session token variant: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig {
            common: core_config::Config {
                log_level: "info".into(),
                otlp_endpoint: None,
            },
            environment: Environment::Dev,
            service_name: "authms".into(),
            service_version: "test".into(),
            log_level: "info".into(),
            database: DatabaseConfig {
                url: "postgres://localhost/authms".into(),
                max_connections: 5,
                min_connections: 1,
            },
            session: SessionConfig::default(),
            gc: GcConfig::default(),
            otp: OtpConfig::default(),
            registration: RegistrationConfig::default(),
            security: SecurityConfig {
                master_api_key: String::new(),
            },
            deadlines: DeadlineConfig::default(),
            tx_retry: RetryConfig::default(),
            twilio: None,
            smtp: None,
            facebook: None,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_otp_validity_below_minimum_is_rejected() {
        let mut cfg = config();
        cfg.otp.validity = Duration::from_secs(59);
        let err = cfg.validate().unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("OTP_VALIDITY_SECONDS"));

        cfg.otp.validity = MIN_OTP_VALIDITY;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_signed_tokens_need_a_secret() {
        let mut cfg = config();
        cfg.session.variant = TokenVariant::Signed;
        assert!(cfg.validate().is_err());

        cfg.session.secret = "s3cr3t".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_gc_interval_is_rejected() {
        let mut cfg = config();
        cfg.gc.short_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_prod_requires_master_key() {
        let mut cfg = config();
        cfg.environment = Environment::Prod;
        assert!(cfg.validate().is_err());

        cfg.security.master_api_key = "master".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_prod_secret_only_required_for_signed_tokens() {
        assert!(!secret_required(Environment::Prod, TokenVariant::Persisted));
        assert!(secret_required(Environment::Prod, TokenVariant::Signed));
        assert!(!secret_required(Environment::Dev, TokenVariant::Signed));

        let mut cfg = config();
        cfg.environment = Environment::Prod;
        cfg.security.master_api_key = "master".into();
        assert_eq!(cfg.session.variant, TokenVariant::Persisted);
        assert!(cfg.session.secret.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("after_commit".parse::<DispatchMode>().unwrap(), DispatchMode::AfterCommit);
        assert_eq!("JWT".parse::<TokenVariant>().unwrap(), TokenVariant::Signed);
        assert!("sometimes".parse::<DispatchMode>().is_err());
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Prod);
    }
}
