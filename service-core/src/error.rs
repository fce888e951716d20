use thiserror::Error;

/// SQLSTATE raised on a unique-constraint violation.
const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE raised when a serializable transaction must be retried.
const SERIALIZATION_FAILURE: &str = "40001";

/// Coarse classification of an [`AppError`], used by transports to pick a
/// status code and by engines to branch on failure without matching variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Client,
    Auth,
    Forbidden,
    NotFound,
    Duplicate,
    NotImplemented,
    Internal,
}

/// Marker carried inside [`AppError::DatabaseError`] when the store reports a
/// serialization conflict. The transaction layer retries on it.
#[derive(Debug, Error)]
#[error("transaction conflict: {0}")]
pub struct TxConflict(pub String);

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Forbidden: {0}")]
    Forbidden(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Invalid token: {0}")]
    InvalidToken(anyhow::Error),

    #[error("Token expired: {0}")]
    TokenExpired(anyhow::Error),

    #[error("Not implemented: {0}")]
    NotImplemented(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Email error: {0}")]
    EmailError(String),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::BadRequest(_) => ErrorKind::Client,
            AppError::Unauthorized(_) | AppError::InvalidToken(_) | AppError::TokenExpired(_) => {
                ErrorKind::Auth
            }
            AppError::Forbidden(_) => ErrorKind::Forbidden,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Conflict(_) => ErrorKind::Duplicate,
            AppError::NotImplemented(_) => ErrorKind::NotImplemented,
            AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::EmailError(_)
            | AppError::ConfigError(_) => ErrorKind::Internal,
        }
    }

    pub fn is_client(&self) -> bool {
        self.kind() == ErrorKind::Client
    }

    /// True for any credential failure, including the Forbidden refinement.
    pub fn is_auth(&self) -> bool {
        matches!(self.kind(), ErrorKind::Auth | ErrorKind::Forbidden)
    }

    pub fn is_forbidden(&self) -> bool {
        self.kind() == ErrorKind::Forbidden
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Duplicate
    }

    pub fn is_not_implemented(&self) -> bool {
        self.kind() == ErrorKind::NotImplemented
    }

    pub fn is_internal(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }

    /// Whether this error is a retryable serialization conflict from the store.
    pub fn is_tx_conflict(&self) -> bool {
        match self {
            AppError::DatabaseError(err) | AppError::InternalError(err) => {
                err.downcast_ref::<TxConflict>().is_some()
            }
            _ => false,
        }
    }

    /// Wraps the error with a context message, keeping its classification.
    pub fn context(self, msg: impl std::fmt::Display + Send + Sync + 'static) -> Self {
        match self {
            AppError::BadRequest(e) => AppError::BadRequest(e.context(msg)),
            AppError::NotFound(e) => AppError::NotFound(e.context(msg)),
            AppError::Unauthorized(e) => AppError::Unauthorized(e.context(msg)),
            AppError::Forbidden(e) => AppError::Forbidden(e.context(msg)),
            AppError::Conflict(e) => AppError::Conflict(e.context(msg)),
            AppError::InvalidToken(e) => AppError::InvalidToken(e.context(msg)),
            AppError::TokenExpired(e) => AppError::TokenExpired(e.context(msg)),
            AppError::NotImplemented(e) => AppError::NotImplemented(e.context(msg)),
            AppError::InternalError(e) => AppError::InternalError(e.context(msg)),
            AppError::DatabaseError(e) => AppError::DatabaseError(e.context(msg)),
            AppError::EmailError(s) => AppError::EmailError(format!("{}: {}", msg, s)),
            AppError::ConfigError(e) => AppError::ConfigError(e.context(msg)),
        }
    }

    /// Message safe to hand back to callers. Internal detail is redacted and
    /// only ever reaches the server-side logs.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// HTTP status a transport should answer with.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Client => 400,
            ErrorKind::Auth => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Duplicate => 409,
            ErrorKind::NotImplemented => 501,
            ErrorKind::Internal => 500,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<lettre::error::Error> for AppError {
    fn from(err: lettre::error::Error) -> Self {
        AppError::EmailError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                AppError::TokenExpired(anyhow::Error::new(err))
            }
            _ => AppError::InvalidToken(anyhow::Error::new(err)),
        }
    }
}

/// The single place driver error codes are interpreted.
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
            _ => None,
        };

        if matches!(err, sqlx::Error::RowNotFound) {
            return AppError::NotFound(anyhow::Error::new(err));
        }

        match code.as_deref() {
            Some(UNIQUE_VIOLATION) => AppError::Conflict(anyhow::Error::new(err)),
            Some(SERIALIZATION_FAILURE) => {
                AppError::DatabaseError(anyhow::Error::new(TxConflict(err.to_string())))
            }
            _ => AppError::DatabaseError(anyhow::Error::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_is_auth_refinement() {
        let err = AppError::Forbidden(anyhow::anyhow!("not an admin"));
        assert!(err.is_forbidden());
        assert!(err.is_auth());
        assert!(!AppError::Unauthorized(anyhow::anyhow!("bad")).is_forbidden());
    }

    #[test]
    fn test_internal_message_is_redacted() {
        let err = AppError::DatabaseError(anyhow::anyhow!("connection refused on 10.0.0.3"));
        assert_eq!(err.public_message(), "Internal server error");
        assert_eq!(err.status_code(), 500);

        let err = AppError::BadRequest(anyhow::anyhow!("password too short"));
        assert!(err.public_message().contains("password too short"));
    }

    #[test]
    fn test_context_keeps_classification() {
        let err = AppError::Conflict(anyhow::anyhow!("duplicate key")).context("insert email binding");
        assert!(err.is_conflict());
        assert!(err.to_string().contains("insert email binding"));
    }

    #[test]
    fn test_tx_conflict_survives_context() {
        let err = AppError::DatabaseError(anyhow::Error::new(TxConflict("restart".into())))
            .context("insert user");
        assert!(err.is_tx_conflict());
        assert!(err.is_internal());
        assert!(!AppError::DatabaseError(anyhow::anyhow!("boom")).is_tx_conflict());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::NotImplemented(anyhow::anyhow!("no sms")).status_code(), 501);
        assert_eq!(AppError::TokenExpired(anyhow::anyhow!("late")).status_code(), 401);
        assert_eq!(AppError::Forbidden(anyhow::anyhow!("no")).status_code(), 403);
    }
}
