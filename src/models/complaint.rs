/// Complaints submitted through the contact form and triaged by admins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::RecordId;
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplaintStatus {
    Pending,
    Resolved,
}

impl ComplaintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplaintStatus::Pending => "pending",
            ComplaintStatus::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplaintPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for ComplaintPriority {
    fn default() -> Self {
        ComplaintPriority::Normal
    }
}

impl fmt::Display for ComplaintPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ComplaintPriority::Low => "low",
            ComplaintPriority::Normal => "normal",
            ComplaintPriority::High => "high",
            ComplaintPriority::Urgent => "urgent",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complaint {
    pub id: RecordId,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub subject: String,
    pub message: String,
    pub status: ComplaintStatus,
    #[serde(default)]
    pub priority: ComplaintPriority,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub admin_reply: Option<String>,
    #[serde(default)]
    pub replied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub replied_by: Option<String>,
}

impl Complaint {
    pub fn is_resolved(&self) -> bool {
        self.status == ComplaintStatus::Resolved
    }
}

/// Contact form submission.
#[derive(Debug, Clone, Serialize)]
pub struct NewComplaint {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub subject: String,
    pub message: String,
    pub priority: ComplaintPriority,
    pub status: ComplaintStatus,
}

impl NewComplaint {
    pub fn new(email: &str, subject: &str, message: &str) -> Self {
        NewComplaint {
            email: email.trim().to_string(),
            phone: None,
            subject: subject.trim().to_string(),
            message: message.trim().to_string(),
            priority: ComplaintPriority::Normal,
            status: ComplaintStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: ComplaintPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_phone(mut self, phone: &str) -> Self {
        self.phone = Some(phone.trim().to_string()).filter(|p| !p.is_empty());
        self
    }
}

/// Status filter for the admin complaint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComplaintFilter {
    #[default]
    All,
    Pending,
    Resolved,
}

impl ComplaintFilter {
    pub fn status(&self) -> Option<ComplaintStatus> {
        match self {
            ComplaintFilter::All => None,
            ComplaintFilter::Pending => Some(ComplaintStatus::Pending),
            ComplaintFilter::Resolved => Some(ComplaintStatus::Resolved),
        }
    }
}

impl FromStr for ComplaintFilter {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(ComplaintFilter::All),
            "pending" => Ok(ComplaintFilter::Pending),
            "resolved" => Ok(ComplaintFilter::Resolved),
            other => Err(ClientError::InvalidInput(format!(
                "Unknown complaint filter '{}' (expected all, pending or resolved)",
                other
            ))),
        }
    }
}

/// Aggregate counters shown on the admin dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ComplaintStats {
    pub total: usize,
    pub pending: usize,
    pub resolved: usize,
    pub urgent_pending: usize,
    pub users: usize,
}
