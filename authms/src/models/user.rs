//! User model - accounts, their identity bindings, groups and user types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier kinds a user can log in with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginType {
    Username,
    Phone,
    Email,
    Facebook,
}

impl LoginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginType::Username => "username",
            LoginType::Phone => "phone",
            LoginType::Email => "email",
            LoginType::Facebook => "facebook",
        }
    }

    /// Bindings a password can be checked against.
    pub fn is_password_comparable(&self) -> bool {
        !matches!(self, LoginType::Facebook)
    }

    /// Whether a fresh binding of this kind needs an OTP round trip before it
    /// counts as verified.
    pub fn needs_verification(&self) -> bool {
        matches!(self, LoginType::Phone | LoginType::Email)
    }
}

impl fmt::Display for LoginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoginType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "username" => Ok(LoginType::Username),
            "phone" => Ok(LoginType::Phone),
            "email" => Ok(LoginType::Email),
            "facebook" => Ok(LoginType::Facebook),
            other => Err(AppError::BadRequest(anyhow::anyhow!(
                "invalid login type: {}",
                other
            ))),
        }
    }
}

/// The fixed set of account types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTypeName {
    Individual,
    Company,
}

impl UserTypeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserTypeName::Individual => "individual",
            UserTypeName::Company => "company",
        }
    }
}

impl FromStr for UserTypeName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "individual" => Ok(UserTypeName::Individual),
            "company" => Ok(UserTypeName::Company),
            other => Err(AppError::BadRequest(anyhow::anyhow!(
                "invalid user type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UserType {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

pub const GROUP_SUPER: &str = "super";
pub const GROUP_ADMIN: &str = "admin";
pub const GROUP_STAFF: &str = "staff";
pub const GROUP_PUBLIC: &str = "public";

/// Most privileged access level.
pub const ACCESS_LEVEL_MIN: i32 = 0;
/// Least privileged access level.
pub const ACCESS_LEVEL_MAX: i32 = 10;

/// Access level assigned when a well-known group is created on demand.
pub fn default_access_level(group_name: &str) -> i32 {
    match group_name {
        GROUP_SUPER => 0,
        GROUP_ADMIN => 3,
        GROUP_STAFF => 7,
        _ => ACCESS_LEVEL_MAX,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    /// 0 (super) through 10 (public).
    pub access_level: i32,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn new(name: &str, access_level: i32, now: DateTime<Utc>) -> Result<Self, AppError> {
        if !(ACCESS_LEVEL_MIN..=ACCESS_LEVEL_MAX).contains(&access_level) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "access level must be between {} and {}",
                ACCESS_LEVEL_MIN,
                ACCESS_LEVEL_MAX
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            access_level,
            created_at: now,
        })
    }
}

/// One identifier bound to a user: a username, phone, email or Facebook id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Binding {
    pub id: Uuid,
    pub user_id: Uuid,
    pub value: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Binding {
    /// A new binding. Only self-asserted channels start out verified.
    pub fn new(user_id: Uuid, login_type: LoginType, value: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            value,
            verified: !login_type.needs_verification(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Device a locked-phone account was registered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
}

/// Row stored in the users table.
#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub type_id: Uuid,
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn new(type_id: Uuid, password_hash: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            type_id,
            password_hash,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fully hydrated account as returned to callers. Never carries the hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub user_type: UserType,
    pub username: Option<Binding>,
    pub phone: Option<Binding>,
    pub email: Option<Binding>,
    pub facebook: Option<Binding>,
    pub groups: Vec<Group>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn binding(&self, login_type: LoginType) -> Option<&Binding> {
        match login_type {
            LoginType::Username => self.username.as_ref(),
            LoginType::Phone => self.phone.as_ref(),
            LoginType::Email => self.email.as_ref(),
            LoginType::Facebook => self.facebook.as_ref(),
        }
    }

    pub fn in_group(&self, group_id: Uuid) -> bool {
        self.groups.iter().any(|g| g.id == group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_type_parsing() {
        assert_eq!("Individual".parse::<UserTypeName>().unwrap(), UserTypeName::Individual);
        assert_eq!("company".parse::<UserTypeName>().unwrap(), UserTypeName::Company);
        assert!("alien".parse::<UserTypeName>().unwrap_err().is_client());
    }

    #[test]
    fn test_binding_verified_defaults() {
        let now = Utc::now();
        let user = Uuid::new_v4();
        assert!(Binding::new(user, LoginType::Username, "alice".into(), now).verified);
        assert!(Binding::new(user, LoginType::Facebook, "fb-1".into(), now).verified);
        assert!(!Binding::new(user, LoginType::Phone, "+254712345678".into(), now).verified);
        assert!(!Binding::new(user, LoginType::Email, "a@example.com".into(), now).verified);
    }

    #[test]
    fn test_group_access_level_bounds() {
        let now = Utc::now();
        assert!(Group::new("custom", 11, now).unwrap_err().is_client());
        assert!(Group::new("custom", -1, now).is_err());
        assert_eq!(Group::new(GROUP_ADMIN, default_access_level(GROUP_ADMIN), now).unwrap().access_level, 3);
        assert_eq!(default_access_level(GROUP_PUBLIC), 10);
    }
}
