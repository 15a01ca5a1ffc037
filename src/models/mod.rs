/// Data models for the study companion client.
/// Rows as stored by the backend, plus the denormalised views shown to users.

pub mod command;
pub mod complaint;
pub mod friend;
pub mod message;
pub mod presence;
pub mod session;
pub mod user;

pub use command::Command;
pub use complaint::{
    Complaint, ComplaintFilter, ComplaintPriority, ComplaintStats, ComplaintStatus, NewComplaint,
};
pub use friend::{
    FriendEdge, FriendRequest, FriendRequestStatus, FriendRequestView, FriendView,
    NewFriendEdge, NewFriendRequest,
};
pub use message::{GroupMessage, GroupMessageView, NewGroupMessage, FEED_WINDOW};
pub use presence::{StudySession, StudySessionView, StudyStatus};
pub use session::{AuthUser, Identity, ProfileMetadata, Session};
pub use user::{display_name, UserProfile};

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Result<Self> {
                Uuid::parse_str(s.trim())
                    .map($name)
                    .map_err(|_| ClientError::InvalidInput(format!("'{}' is not a valid id", s)))
            }

            /// First eight hex digits, used where a full id is too noisy.
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = ClientError;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse(s)
            }
        }

        impl From<$name> for Value {
            fn from(id: $name) -> Value {
                Value::String(id.to_string())
            }
        }
    };
}

uuid_id!(
    /// Identifier of a user (auth identity and profile row share it).
    UserId
);

uuid_id!(
    /// Identifier of any other row.
    RecordId
);

/// Decode backend rows into typed records.
pub fn decode_rows<T: serde::de::DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(ClientError::from))
        .collect()
}
