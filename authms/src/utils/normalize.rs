//! Validation and canonical forms for login identifiers.
//!
//! Every function here is pure and idempotent: feeding a normalized value back
//! in returns it unchanged.

use once_cell::sync::Lazy;
use regex::Regex;
use service_core::error::AppError;
use std::collections::HashSet;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use crate::models::LoginType;

const MIN_PHONE_DIGITS: usize = 6;
const MAX_PHONE_DIGITS: usize = 15;

/// Local part of an email address; `.` and `+` are not accepted.
static EMAIL_LOCAL_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_-]+$").expect("email local-part pattern"));

fn bad_request(msg: impl std::fmt::Display) -> AppError {
    AppError::BadRequest(anyhow::anyhow!("{}", msg))
}

/// Keeps digits and a leading `+`.
pub fn normalize_phone(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() < MIN_PHONE_DIGITS || digits.len() > MAX_PHONE_DIGITS {
        return Err(bad_request(format!(
            "phone number must have between {} and {} digits",
            MIN_PHONE_DIGITS, MAX_PHONE_DIGITS
        )));
    }

    if trimmed.starts_with('+') {
        Ok(format!("+{}", digits))
    } else {
        Ok(digits)
    }
}

/// Lowercases and strips diacritics, transliterating to the closest ASCII.
pub fn normalize_username(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(bad_request("username cannot be empty"));
    }
    if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(bad_request("username cannot contain whitespace"));
    }

    let mut out = String::with_capacity(trimmed.len());
    for c in trimmed.to_lowercase().nfd().filter(|c| !is_combining_mark(*c)) {
        match c {
            'ß' => out.push_str("ss"),
            'æ' => out.push_str("ae"),
            'œ' => out.push_str("oe"),
            'þ' => out.push_str("th"),
            'ø' => out.push('o'),
            'đ' | 'ð' => out.push('d'),
            'ł' => out.push('l'),
            'ı' => out.push('i'),
            other => out.push(other),
        }
    }

    Ok(out)
}

/// Normalizer carrying the deployment's email domain allow-list.
#[derive(Debug, Clone, Default)]
pub struct IdentityNormalizer {
    allowed_email_domains: HashSet<String>,
}

impl IdentityNormalizer {
    pub fn new<I, S>(allowed_email_domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_email_domains: allowed_email_domains
                .into_iter()
                .map(|d| d.as_ref().trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    pub fn phone(&self, raw: &str) -> Result<String, AppError> {
        normalize_phone(raw)
    }

    pub fn username(&self, raw: &str) -> Result<String, AppError> {
        normalize_username(raw)
    }

    /// Lowercases and checks the local part and domain allow-list.
    pub fn email(&self, raw: &str) -> Result<String, AppError> {
        let lowered = raw.trim().to_lowercase();

        let (local, domain) = match lowered.split_once('@') {
            Some((local, domain)) if !domain.contains('@') => (local, domain),
            _ => return Err(bad_request("email must contain exactly one '@'")),
        };

        if !EMAIL_LOCAL_PART.is_match(local) {
            return Err(bad_request(
                "email local part may only contain letters, digits, '_' and '-'",
            ));
        }

        if !self.allowed_email_domains.contains(domain) {
            return Err(bad_request(format!("email domain '{}' is not allowed", domain)));
        }

        Ok(lowered)
    }

    /// Normalizes `raw` according to the identifier type it will be bound as.
    pub fn identifier(&self, login_type: LoginType, raw: &str) -> Result<String, AppError> {
        match login_type {
            LoginType::Username => self.username(raw),
            LoginType::Phone => self.phone(raw),
            LoginType::Email => self.email(raw),
            LoginType::Facebook => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(bad_request("identifier cannot be empty"));
                }
                Ok(trimmed.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> IdentityNormalizer {
        IdentityNormalizer::new(["example.com", "Mail.CO.ke"])
    }

    #[test]
    fn test_phone_keeps_digits_and_leading_plus() {
        assert_eq!(normalize_phone("+254 (712) 345-678").unwrap(), "+254712345678");
        assert_eq!(normalize_phone("0712 345 678").unwrap(), "0712345678");
    }

    #[test]
    fn test_phone_is_idempotent() {
        let once = normalize_phone("+1-555-010-9999").unwrap();
        assert_eq!(normalize_phone(&once).unwrap(), once);
    }

    #[test]
    fn test_phone_rejects_too_few_digits() {
        assert!(normalize_phone("12-34").unwrap_err().is_client());
        assert!(normalize_phone("no digits").unwrap_err().is_client());
    }

    #[test]
    fn test_email_lowercases() {
        assert_eq!(
            normalizer().email(" John_Doe@EXAMPLE.com ").unwrap(),
            "john_doe@example.com"
        );
        assert_eq!(normalizer().email("a-b@mail.co.ke").unwrap(), "a-b@mail.co.ke");
    }

    #[test]
    fn test_email_rejects_extensions() {
        assert!(normalizer().email("john+spam@example.com").unwrap_err().is_client());
        assert!(normalizer().email("john.doe@example.com").unwrap_err().is_client());
    }

    #[test]
    fn test_email_rejects_unlisted_domain() {
        assert!(normalizer().email("john@evil.org").unwrap_err().is_client());
        assert!(IdentityNormalizer::default()
            .email("john@example.com")
            .unwrap_err()
            .is_client());
    }

    #[test]
    fn test_email_rejects_missing_or_double_at() {
        assert!(normalizer().email("example.com").is_err());
        assert!(normalizer().email("a@b@example.com").is_err());
        assert!(normalizer().email("@example.com").is_err());
    }

    #[test]
    fn test_username_strips_diacritics() {
        assert_eq!(normalize_username("Zoë").unwrap(), "zoe");
        assert_eq!(normalize_username("Ñandú").unwrap(), "nandu");
        assert_eq!(normalize_username("Straße").unwrap(), "strasse");
        assert_eq!(normalize_username("ALICE").unwrap(), "alice");
    }

    #[test]
    fn test_username_is_idempotent() {
        let once = normalize_username("Łukasz").unwrap();
        assert_eq!(once, "lukasz");
        assert_eq!(normalize_username(&once).unwrap(), once);
    }

    #[test]
    fn test_username_rejects_blank_and_whitespace() {
        assert!(normalize_username("   ").unwrap_err().is_client());
        assert!(normalize_username("al ice").unwrap_err().is_client());
    }

    #[test]
    fn test_identifier_dispatch() {
        let n = normalizer();
        assert!(n.identifier(LoginType::Phone, "+254-71").unwrap_err().is_client());
        assert_eq!(n.identifier(LoginType::Username, "Bob").unwrap(), "bob");
        assert_eq!(n.identifier(LoginType::Facebook, " 1234 ").unwrap(), "1234");
    }
}
