//! The hosted backend as seen by the client.
//!
//! `DataService` covers row access and change subscriptions, `AuthService`
//! covers identity. `memory` implements both in-process; `rest`, `auth` and
//! `realtime` talk to a PostgREST-style deployment.

pub mod auth;
pub mod memory;
pub mod query;
pub mod realtime;
pub mod rest;

pub use auth::RestAuth;
pub use memory::{MemoryAuth, MemoryBackend, Operation};
pub use query::{Filter, Order, Query};
pub use realtime::{ConnectionState, RealtimeClient};
pub use rest::{BackendConfig, RestClient, TokenSlot};

use crate::error::Result;
use crate::models::{AuthUser, ProfileMetadata, Session, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Friends,
    FriendRequests,
    StudySessions,
    GroupMessages,
    Complaints,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Users,
        Table::Friends,
        Table::FriendRequests,
        Table::StudySessions,
        Table::GroupMessages,
        Table::Complaints,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Friends => "friends",
            Table::FriendRequests => "friend_requests",
            Table::StudySessions => "study_sessions",
            Table::GroupMessages => "group_messages",
            Table::Complaints => "complaints",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];
}

/// A row-level change pushed by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub record: Option<Value>,
    pub old_record: Option<Value>,
}

/// A live change stream for one table. Dropping it (or calling
/// `unsubscribe`) ends the subscription.
#[derive(Debug)]
pub struct Subscription {
    table: Table,
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(table: Table, receiver: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Subscription { table, receiver }
    }

    /// Subscription plus the sender a backend pushes into.
    pub fn channel(table: Table) -> (mpsc::UnboundedSender<ChangeEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Subscription::new(table, rx))
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Next change, or `None` once the backend side has gone away.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Change already queued, without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.receiver.close();
    }
}

/// Row store with per-table change notifications.
pub trait DataService: Send + Sync + 'static {
    fn select(&self, table: Table, query: Query)
        -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// Insert rows, returning them as stored (ids and defaults filled in).
    fn insert(&self, table: Table, rows: Vec<Value>)
        -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// Apply `patch` to every row matching `filter`, returning the updated rows.
    fn update(
        &self,
        table: Table,
        patch: Value,
        filter: Filter,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// Delete matching rows, returning how many went.
    fn delete(&self, table: Table, filter: Filter) -> impl Future<Output = Result<usize>> + Send;

    /// Insert `row`, or merge it into the existing row with the same
    /// `conflict_key` column value.
    fn upsert(
        &self,
        table: Table,
        row: Value,
        conflict_key: &str,
    ) -> impl Future<Output = Result<Value>> + Send;

    fn subscribe(
        &self,
        table: Table,
        kinds: &[ChangeKind],
    ) -> impl Future<Output = Result<Subscription>> + Send;
}

/// Identity provider.
pub trait AuthService: Send + Sync + 'static {
    /// Current session, restoring or refreshing it if needed.
    fn get_session(&self) -> impl Future<Output = Result<Option<Session>>> + Send;

    /// Every session change: sign-in, refresh, sign-out.
    fn on_session_change(&self) -> watch::Receiver<Option<Session>>;

    fn sign_in(&self, email: &str, password: &str)
        -> impl Future<Output = Result<Session>> + Send;

    fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: ProfileMetadata,
    ) -> impl Future<Output = Result<AuthUser>> + Send;

    fn sign_out(&self) -> impl Future<Output = Result<()>> + Send;

    /// Privileged: remove an auth identity.
    fn delete_user(&self, id: UserId) -> impl Future<Output = Result<()>> + Send;
}
