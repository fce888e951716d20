use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use service_core::error::AppError;
use std::fmt;

/// Shortest secret accepted at registration or password change.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Newtype for password to prevent accidental logging
#[derive(Clone)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rejects secrets shorter than [`MIN_PASSWORD_LEN`] characters.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.0.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password([REDACTED])")
    }
}

/// Newtype for an Argon2 PHC hash string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHashString(String);

impl PasswordHashString {
    pub fn new(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Hash a password using Argon2
///
/// Uses Argon2id variant with secure default parameters.
/// Salt is automatically generated and included in the hash.
pub fn hash_password(password: &Password) -> Result<PasswordHashString, AppError> {
    hash_secret(password.as_str())
}

/// Salted Argon2 hash of any secret, also used for verification codes.
pub fn hash_secret(secret: &str) -> Result<PasswordHashString, AppError> {
    let salt = SaltString::generate(&mut OsRng);

    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to hash secret: {}", e)))?
        .to_string();

    Ok(PasswordHashString::new(hash))
}

/// Verify a password against a hash using constant-time comparison
///
/// A mismatch is `Unauthorized`; an unparsable stored hash is internal.
pub fn verify_password(
    password: &Password,
    password_hash: &PasswordHashString,
) -> Result<(), AppError> {
    verify_secret(password.as_str(), password_hash)
}

pub fn verify_secret(secret: &str, hash: &PasswordHashString) -> Result<(), AppError> {
    let parsed_hash = PasswordHash::new(hash.as_str()).map_err(|e| {
        AppError::InternalError(anyhow::anyhow!("Invalid password hash format: {}", e))
    })?;

    Argon2::default()
        .verify_password(secret.as_bytes(), &parsed_hash)
        .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("secret verification failed")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_password() {
        let password = Password::new("mySecurePassword123");
        let hash = hash_password(&password).expect("Failed to hash password");

        assert!(hash.as_str().starts_with("$argon2"));
        assert!(!hash.as_str().contains("mySecurePassword123"));
    }

    #[test]
    fn test_verify_password_correct() {
        let password = Password::new("mySecurePassword123");
        let hash = hash_password(&password).expect("Failed to hash password");

        assert!(verify_password(&password, &hash).is_ok());
    }

    #[test]
    fn test_verify_password_incorrect_is_unauthorized() {
        let password = Password::new("mySecurePassword123");
        let hash = hash_password(&password).expect("Failed to hash password");

        let err = verify_password(&Password::new("wrongPassword"), &hash).unwrap_err();
        assert!(err.is_auth());
    }

    #[test]
    fn test_corrupt_hash_is_internal() {
        let err = verify_secret("123456", &PasswordHashString::new("not-a-phc".into())).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_min_length() {
        assert!(Password::new("1234567").validate().unwrap_err().is_client());
        assert!(Password::new("12345678").validate().is_ok());
    }

    #[test]
    fn test_debug_is_redacted() {
        let rendered = format!("{:?}", Password::new("hunter22hunter"));
        assert!(!rendered.contains("hunter22"));
    }
}
