/// Study presence records, one row per user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{RecordId, UserId};
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudyStatus {
    Studying,
    Break,
    Offline,
}

impl StudyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudyStatus::Studying => "studying",
            StudyStatus::Break => "break",
            StudyStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for StudyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StudyStatus {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "studying" => Ok(StudyStatus::Studying),
            "break" => Ok(StudyStatus::Break),
            "offline" => Ok(StudyStatus::Offline),
            other => Err(ClientError::InvalidInput(format!(
                "Unknown study status '{}' (expected studying, break or offline)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    pub user_id: UserId,
    pub status: StudyStatus,
    #[serde(default)]
    pub subject: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl StudySession {
    /// Presence row for `user_id` stamped with the current time.
    pub fn now(user_id: UserId, status: StudyStatus, subject: Option<String>) -> Self {
        let now = Utc::now();
        StudySession {
            id: None,
            user_id,
            status,
            subject: subject.filter(|s| !s.trim().is_empty()),
            started_at: now,
            last_active: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudySessionView {
    pub user_id: UserId,
    pub name: String,
    pub status: StudyStatus,
    pub subject: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub is_self: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!("studying".parse::<StudyStatus>().unwrap(), StudyStatus::Studying);
        assert_eq!(" Break ".parse::<StudyStatus>().unwrap(), StudyStatus::Break);
        assert!("sleeping".parse::<StudyStatus>().is_err());
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&StudyStatus::Break).unwrap();
        assert_eq!(json, "\"break\"");
    }

    #[test]
    fn test_session_now_drops_blank_subject() {
        let session = StudySession::now(UserId::new(), StudyStatus::Studying, Some("  ".into()));
        assert!(session.subject.is_none());
        assert_eq!(session.started_at, session.last_active);

        let row = serde_json::to_value(&session).unwrap();
        assert!(row.get("id").is_none());
    }
}
