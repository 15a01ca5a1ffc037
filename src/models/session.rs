/// Authentication session and the identity derived from it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{display_name, UserId};

/// Profile fields sent along with sign-up and echoed back on the auth user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: UserId,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "user_metadata", default)]
    pub metadata: ProfileMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: AuthUser,
}

impl Session {
    /// True when the access token expires within `margin`.
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at <= Utc::now() + margin
    }

    pub fn identity(&self) -> Identity {
        Identity::from(&self.user)
    }
}

/// The signed-in user as seen by the services.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    pub id: UserId,
    pub email: String,
    pub name: String,
}

impl From<&AuthUser> for Identity {
    fn from(user: &AuthUser) -> Self {
        Identity {
            id: user.id,
            email: user.email.clone(),
            name: display_name(user.metadata.name.as_deref(), Some(&user.email), &user.id),
        }
    }
}
