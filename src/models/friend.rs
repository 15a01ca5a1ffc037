/// Friend edges and friend requests.
/// A mutual friendship is two directed edges; a request moves from pending to
/// accepted or rejected and is never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RecordId, UserId};

/// Directed edge: `user_id` considers `friend_id` a friend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendEdge {
    pub id: RecordId,
    pub user_id: UserId,
    pub friend_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewFriendEdge {
    pub user_id: UserId,
    pub friend_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendRequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl FriendRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendRequestStatus::Pending => "pending",
            FriendRequestStatus::Accepted => "accepted",
            FriendRequestStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendRequest {
    pub id: RecordId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub status: FriendRequestStatus,
    pub created_at: DateTime<Utc>,
}

impl FriendRequest {
    /// The other side of the request, seen from `me`.
    pub fn counterpart(&self, me: &UserId) -> UserId {
        if &self.sender_id == me {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewFriendRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub status: FriendRequestStatus,
}

impl NewFriendRequest {
    pub fn pending(sender_id: UserId, receiver_id: UserId) -> Self {
        NewFriendRequest {
            sender_id,
            receiver_id,
            status: FriendRequestStatus::Pending,
        }
    }
}

/// A friend edge with the friend's profile folded in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FriendView {
    pub edge_id: RecordId,
    pub friend_id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub since: DateTime<Utc>,
}

/// A pending request with the other party's profile folded in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FriendRequestView {
    pub id: RecordId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// The user on the other side of the request.
    pub other_id: UserId,
    pub other_name: String,
    pub other_email: Option<String>,
    pub created_at: DateTime<Utc>,
}
