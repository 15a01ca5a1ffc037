/// Group chat messages.
/// The feed is append-only; readers see the newest `FEED_WINDOW` messages,
/// oldest first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::{RecordId, UserId};

/// Number of most recent messages loaded into the feed.
pub const FEED_WINDOW: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub id: RecordId,
    pub user_id: UserId,
    pub message: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub mentions: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewGroupMessage {
    pub user_id: UserId,
    pub message: String,
    pub mentions: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMessageView {
    pub id: RecordId,
    pub user_id: UserId,
    pub author: String,
    pub message: String,
    pub mentions: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub is_own: bool,
    pub mentions_me: bool,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<UserId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<UserId>>::deserialize(deserializer)?.unwrap_or_default())
}
