//! Audit history - outcomes of logins, registrations and credential changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Login,
    Registration,
    UpdateIdentifier,
    UpdatePassword,
    ResetPassword,
    Verification,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Login => "login",
            HistoryAction::Registration => "registration",
            HistoryAction::UpdateIdentifier => "update_identifier",
            HistoryAction::UpdatePassword => "update_password",
            HistoryAction::ResetPassword => "reset_password",
            HistoryAction::Verification => "verification",
        }
    }
}

impl FromStr for HistoryAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login" => Ok(HistoryAction::Login),
            "registration" => Ok(HistoryAction::Registration),
            "update_identifier" => Ok(HistoryAction::UpdateIdentifier),
            "update_password" => Ok(HistoryAction::UpdatePassword),
            "reset_password" => Ok(HistoryAction::ResetPassword),
            "verification" => Ok(HistoryAction::Verification),
            other => Err(AppError::BadRequest(anyhow::anyhow!(
                "invalid history action: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: HistoryAction,
    pub successful: bool,
    pub ip_address: Option<String>,
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl History {
    pub fn new(
        user_id: Option<Uuid>,
        action: HistoryAction,
        successful: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            action,
            successful,
            ip_address: None,
            device_id: None,
            created_at: now,
        }
    }

    pub fn with_device(mut self, device_id: Option<String>) -> Self {
        self.device_id = device_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_parse_back() {
        assert_eq!("reset_password".parse::<HistoryAction>().unwrap(), HistoryAction::ResetPassword);
        assert_eq!(
            HistoryAction::UpdateIdentifier.as_str().parse::<HistoryAction>().unwrap(),
            HistoryAction::UpdateIdentifier
        );
        assert!("logout".parse::<HistoryAction>().unwrap_err().is_client());
    }
}
