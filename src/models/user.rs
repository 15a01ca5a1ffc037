/// User profile rows.
/// Profiles are owned by the backend; the client only reads them to put names
/// next to ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn new(id: UserId, name: &str, email: &str) -> Self {
        UserProfile {
            id,
            name: Some(name.to_string()),
            email: Some(email.to_string()),
            institution: None,
            phone: None,
            created_at: None,
        }
    }

    pub fn display_name(&self) -> String {
        display_name(self.name.as_deref(), self.email.as_deref(), &self.id)
    }
}

/// Name to show for a user: the profile name, else the local part of the
/// email, else a placeholder derived from the id.
pub fn display_name(name: Option<&str>, email: Option<&str>, id: &UserId) -> String {
    if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    if let Some(prefix) = email
        .and_then(|e| e.split('@').next())
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        return prefix.to_string();
    }

    format!("User {}", id.short())
}
