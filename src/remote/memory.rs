//! In-process backend.
//!
//! Holds every table in memory, enforces the same uniqueness constraints as
//! `sql/schema.sql`, and pushes change events to subscribers. One
//! `MemoryBackend` is the shared "server"; each simulated client gets its own
//! `MemoryAuth` on top of it.

use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{AuthService, ChangeEvent, ChangeKind, DataService, Filter, Query, Subscription, Table};
use crate::error::{ClientError, Result};
use crate::models::{AuthUser, ProfileMetadata, Session, UserId};

/// Operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Upsert,
    Subscribe,
    SignIn,
    SignUp,
    SignOut,
    DeleteUser,
}

struct UniqueKey {
    columns: &'static [&'static str],
    /// Column order does not matter (`(a, b)` collides with `(b, a)`).
    unordered: bool,
    /// Only rows with this column value take part.
    only_when: Option<(&'static str, &'static str)>,
}

fn unique_keys(table: Table) -> &'static [UniqueKey] {
    match table {
        Table::Users => &[UniqueKey {
            columns: &["email"],
            unordered: false,
            only_when: None,
        }],
        Table::Friends => &[UniqueKey {
            columns: &["user_id", "friend_id"],
            unordered: false,
            only_when: None,
        }],
        Table::FriendRequests => &[UniqueKey {
            columns: &["sender_id", "receiver_id"],
            unordered: true,
            only_when: Some(("status", "pending")),
        }],
        Table::StudySessions => &[UniqueKey {
            columns: &["user_id"],
            unordered: false,
            only_when: None,
        }],
        Table::GroupMessages | Table::Complaints => &[],
    }
}

fn has_created_at(table: Table) -> bool {
    !matches!(table, Table::StudySessions)
}

impl UniqueKey {
    fn applies(&self, row: &Value) -> bool {
        // Like SQL, nulls never collide.
        if self.columns.iter().any(|c| row.get(*c).map_or(true, Value::is_null)) {
            return false;
        }
        match self.only_when {
            Some((column, value)) => row.get(column).and_then(Value::as_str) == Some(value),
            None => true,
        }
    }

    fn key(&self, row: &Value) -> Vec<String> {
        let mut key: Vec<String> = self
            .columns
            .iter()
            .map(|c| row.get(*c).map(Value::to_string).unwrap_or_default())
            .collect();
        if self.unordered {
            key.sort();
        }
        key
    }

    fn collides(&self, a: &Value, b: &Value) -> bool {
        self.applies(a) && self.applies(b) && self.key(a) == self.key(b)
    }
}

struct Subscriber {
    table: Table,
    kinds: Vec<ChangeKind>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

struct Account {
    user: AuthUser,
    password: String,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<Table, Vec<Value>>,
    subscribers: Vec<Subscriber>,
    accounts: HashMap<String, Account>,
    failures: Vec<(Operation, Option<Table>)>,
}

impl MemoryState {
    fn take_failure(&mut self, op: Operation, table: Option<Table>) -> Result<()> {
        let position = self
            .failures
            .iter()
            .position(|(o, t)| *o == op && (t.is_none() || *t == table));

        match position {
            Some(index) => {
                self.failures.remove(index);
                Err(ClientError::Server(format!(
                    "injected {:?} failure{}",
                    op,
                    table.map(|t| format!(" on {}", t)).unwrap_or_default()
                )))
            }
            None => Ok(()),
        }
    }

    fn rows(&mut self, table: Table) -> &mut Vec<Value> {
        self.tables.entry(table).or_default()
    }

    fn check_unique(&self, table: Table, candidate: &Value, skip: Option<usize>, extra: &[Value]) -> Result<()> {
        let existing = self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[]);
        for key in unique_keys(table) {
            let clash = existing
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != skip)
                .map(|(_, row)| row)
                .chain(extra.iter())
                .any(|row| key.collides(row, candidate));

            if clash {
                return Err(ClientError::Conflict(format!(
                    "duplicate key value violates unique constraint on {} ({})",
                    table,
                    key.columns.join(", ")
                )));
            }
        }
        Ok(())
    }

    fn emit(&mut self, event: ChangeEvent) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in &self.subscribers {
            if subscriber.table == event.table && subscriber.kinds.contains(&event.kind) {
                let _ = subscriber.tx.send(event.clone());
            }
        }
    }

    fn insert(&mut self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>> {
        let mut prepared: Vec<Value> = Vec::with_capacity(rows.len());
        for row in rows {
            let mut object = into_object(row)?;
            object
                .entry("id")
                .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
            if has_created_at(table) {
                object
                    .entry("created_at")
                    .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
            }
            let row = Value::Object(object);
            self.check_unique(table, &row, None, &prepared)?;
            prepared.push(row);
        }

        self.rows(table).extend(prepared.iter().cloned());
        for row in &prepared {
            self.emit(ChangeEvent {
                table,
                kind: ChangeKind::Insert,
                record: Some(row.clone()),
                old_record: None,
            });
        }
        Ok(prepared)
    }

    fn update_where(&mut self, table: Table, patch: &Map<String, Value>, filter: &Filter) -> Result<Vec<Value>> {
        let matching: Vec<usize> = self
            .rows(table)
            .iter()
            .enumerate()
            .filter(|(_, row)| filter.matches(row))
            .map(|(i, _)| i)
            .collect();

        let mut changes = Vec::with_capacity(matching.len());
        for index in &matching {
            let old = self.rows(table)[*index].clone();
            let mut updated = old.clone();
            if let Value::Object(object) = &mut updated {
                for (k, v) in patch {
                    object.insert(k.clone(), v.clone());
                }
            }
            self.check_unique(table, &updated, Some(*index), &[])?;
            changes.push((*index, old, updated));
        }

        let mut updated_rows = Vec::with_capacity(changes.len());
        for (index, old, updated) in changes {
            self.rows(table)[index] = updated.clone();
            self.emit(ChangeEvent {
                table,
                kind: ChangeKind::Update,
                record: Some(updated.clone()),
                old_record: Some(old),
            });
            updated_rows.push(updated);
        }
        Ok(updated_rows)
    }
}

fn into_object(row: Value) -> Result<Map<String, Value>> {
    match row {
        Value::Object(object) => Ok(object),
        other => Err(ClientError::Server(format!("row must be a JSON object, got {}", other))),
    }
}

/// Shared in-process backend. Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| ClientError::Storage("Failed to lock memory backend".to_string()))
    }

    /// Make the next matching call fail with a server error. `None` matches
    /// any table.
    pub fn fail_next(&self, op: Operation, table: Option<Table>) {
        if let Ok(mut state) = self.state() {
            state.failures.push((op, table));
        }
    }

    /// Snapshot of a table, in insertion order.
    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.state()
            .map(|s| s.tables.get(&table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Live subscriptions on a table.
    pub fn subscriber_count(&self, table: Table) -> usize {
        self.state()
            .map(|s| {
                s.subscribers
                    .iter()
                    .filter(|sub| sub.table == table && !sub.tx.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn has_account(&self, id: &UserId) -> bool {
        self.state()
            .map(|s| s.accounts.values().any(|a| &a.user.id == id))
            .unwrap_or(false)
    }
}

impl DataService for MemoryBackend {
    async fn select(&self, table: Table, query: Query) -> Result<Vec<Value>> {
        let mut state = self.state()?;
        state.take_failure(Operation::Select, Some(table))?;

        let matching = state
            .rows(table)
            .iter()
            .filter(|row| query.filter.matches(row))
            .cloned()
            .collect();
        Ok(query.shape(matching))
    }

    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>> {
        let mut state = self.state()?;
        state.take_failure(Operation::Insert, Some(table))?;
        state.insert(table, rows)
    }

    async fn update(&self, table: Table, patch: Value, filter: Filter) -> Result<Vec<Value>> {
        let mut state = self.state()?;
        state.take_failure(Operation::Update, Some(table))?;
        let patch = into_object(patch)?;
        state.update_where(table, &patch, &filter)
    }

    async fn delete(&self, table: Table, filter: Filter) -> Result<usize> {
        let mut state = self.state()?;
        state.take_failure(Operation::Delete, Some(table))?;

        let (removed, kept): (Vec<Value>, Vec<Value>) =
            std::mem::take(state.rows(table)).into_iter().partition(|row| filter.matches(row));
        *state.rows(table) = kept;

        for row in &removed {
            state.emit(ChangeEvent {
                table,
                kind: ChangeKind::Delete,
                record: None,
                old_record: Some(row.clone()),
            });
        }
        Ok(removed.len())
    }

    async fn upsert(&self, table: Table, row: Value, conflict_key: &str) -> Result<Value> {
        let mut state = self.state()?;
        state.take_failure(Operation::Upsert, Some(table))?;

        let object = into_object(row)?;
        let key = object.get(conflict_key).cloned().ok_or_else(|| {
            ClientError::Server(format!("upsert row is missing conflict column {}", conflict_key))
        })?;

        let filter = Filter::Eq(conflict_key.to_string(), key);
        let exists = state.rows(table).iter().any(|r| filter.matches(r));
        let mut stored = if exists {
            state.update_where(table, &object, &filter)?
        } else {
            state.insert(table, vec![Value::Object(object)])?
        };

        stored
            .pop()
            .ok_or_else(|| ClientError::Server(format!("upsert on {} stored nothing", table)))
    }

    async fn subscribe(&self, table: Table, kinds: &[ChangeKind]) -> Result<Subscription> {
        let mut state = self.state()?;
        state.take_failure(Operation::Subscribe, Some(table))?;

        let (tx, subscription) = Subscription::channel(table);
        state.subscribers.push(Subscriber {
            table,
            kinds: kinds.to_vec(),
            tx,
        });
        Ok(subscription)
    }
}

/// One client's view of the in-process identity provider.
pub struct MemoryAuth {
    backend: MemoryBackend,
    session: watch::Sender<Option<Session>>,
}

impl MemoryAuth {
    pub fn new(backend: MemoryBackend) -> Self {
        let (session, _) = watch::channel(None);
        MemoryAuth { backend, session }
    }

    fn issue(&self, user: AuthUser) -> Session {
        let session = Session {
            access_token: Uuid::new_v4().to_string(),
            refresh_token: Uuid::new_v4().to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            user,
        };
        self.session.send_replace(Some(session.clone()));
        session
    }
}

impl AuthService for MemoryAuth {
    async fn get_session(&self) -> Result<Option<Session>> {
        Ok(self.session.borrow().clone())
    }

    fn on_session_change(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let user = {
            let mut state = self.backend.state()?;
            state.take_failure(Operation::SignIn, None)?;
            match state.accounts.get(&email.trim().to_lowercase()) {
                Some(account) if account.password == password => account.user.clone(),
                _ => return Err(ClientError::Auth("Invalid login credentials".to_string())),
            }
        };
        Ok(self.issue(user))
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: ProfileMetadata) -> Result<AuthUser> {
        let user = {
            let mut state = self.backend.state()?;
            state.take_failure(Operation::SignUp, None)?;

            let key = email.trim().to_lowercase();
            if state.accounts.contains_key(&key) {
                return Err(ClientError::Auth("User already registered".to_string()));
            }

            let user = AuthUser {
                id: UserId::new(),
                email: key.clone(),
                metadata,
            };
            state.accounts.insert(
                key,
                Account {
                    user: user.clone(),
                    password: password.to_string(),
                },
            );
            user
        };

        // Accounts are auto-confirmed, so sign-up also signs in.
        self.issue(user.clone());
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        self.backend.state()?.take_failure(Operation::SignOut, None)?;
        self.session.send_replace(None);
        Ok(())
    }

    async fn delete_user(&self, id: UserId) -> Result<()> {
        {
            let mut state = self.backend.state()?;
            state.take_failure(Operation::DeleteUser, None)?;

            let before = state.accounts.len();
            state.accounts.retain(|_, a| a.user.id != id);
            if state.accounts.len() == before {
                return Err(ClientError::NotFound(format!("auth user {}", id)));
            }
        }

        self.session.send_if_modified(|current| {
            if current.as_ref().map(|s| s.user.id) == Some(id) {
                *current = None;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_fills_defaults() {
        let backend = MemoryBackend::new();
        let rows = backend
            .insert(Table::GroupMessages, vec![json!({ "message": "hi" })])
            .await
            .unwrap();

        assert!(rows[0]["id"].is_string());
        assert!(rows[0]["created_at"].is_string());
        assert_eq!(backend.rows(Table::GroupMessages).len(), 1);
    }

    #[tokio::test]
    async fn test_pending_pair_is_unique_in_both_directions() {
        let backend = MemoryBackend::new();
        let pending = |s: &str, r: &str| json!({ "sender_id": s, "receiver_id": r, "status": "pending" });

        backend.insert(Table::FriendRequests, vec![pending("a", "b")]).await.unwrap();
        let err = backend
            .insert(Table::FriendRequests, vec![pending("b", "a")])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Conflict(_)));

        // Closed requests do not block a new pending one.
        backend
            .update(
                Table::FriendRequests,
                json!({ "status": "rejected" }),
                Filter::eq("sender_id", "a"),
            )
            .await
            .unwrap();
        backend.insert(Table::FriendRequests, vec![pending("b", "a")]).await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_insert_is_all_or_nothing() {
        let backend = MemoryBackend::new();
        let edge = json!({ "user_id": "a", "friend_id": "b" });

        let err = backend
            .insert(Table::Friends, vec![edge.clone(), edge])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Conflict(_)));
        assert!(backend.rows(Table::Friends).is_empty());
    }

    #[tokio::test]
    async fn test_upsert_merges_on_conflict_key() {
        let backend = MemoryBackend::new();
        backend
            .upsert(Table::StudySessions, json!({ "user_id": "a", "status": "studying" }), "user_id")
            .await
            .unwrap();
        let stored = backend
            .upsert(Table::StudySessions, json!({ "user_id": "a", "status": "break" }), "user_id")
            .await
            .unwrap();

        assert_eq!(stored["status"], "break");
        assert_eq!(backend.rows(Table::StudySessions).len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_matching_kinds() {
        let backend = MemoryBackend::new();
        let mut inserts = backend
            .subscribe(Table::GroupMessages, &[ChangeKind::Insert])
            .await
            .unwrap();
        let mut everything = backend.subscribe(Table::GroupMessages, &ChangeKind::ALL).await.unwrap();

        backend
            .insert(Table::GroupMessages, vec![json!({ "message": "hi" })])
            .await
            .unwrap();
        backend.delete(Table::GroupMessages, Filter::All).await.unwrap();

        assert_eq!(inserts.try_next().map(|e| e.kind), Some(ChangeKind::Insert));
        assert!(inserts.try_next().is_none());
        assert_eq!(everything.try_next().map(|e| e.kind), Some(ChangeKind::Insert));
        assert_eq!(everything.try_next().map(|e| e.kind), Some(ChangeKind::Delete));
    }

    #[tokio::test]
    async fn test_unsubscribe_prunes_subscriber() {
        let backend = MemoryBackend::new();
        let sub = backend.subscribe(Table::Friends, &ChangeKind::ALL).await.unwrap();
        assert_eq!(backend.subscriber_count(Table::Friends), 1);

        sub.unsubscribe();
        assert_eq!(backend.subscriber_count(Table::Friends), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let backend = MemoryBackend::new();
        backend.fail_next(Operation::Select, Some(Table::Users));

        assert!(backend.select(Table::Users, Query::new()).await.is_err());
        assert!(backend.select(Table::Users, Query::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_auth_sign_up_sign_in_and_out() {
        let backend = MemoryBackend::new();
        let auth = MemoryAuth::new(backend.clone());
        let mut changes = auth.on_session_change();

        let user = auth
            .sign_up("Ann@Uni.edu", "secret1", ProfileMetadata::default())
            .await
            .unwrap();
        assert_eq!(user.email, "ann@uni.edu");
        assert!(changes.has_changed().unwrap());
        assert!(changes.borrow_and_update().is_some());

        auth.sign_out().await.unwrap();
        assert!(auth.get_session().await.unwrap().is_none());

        assert!(auth.sign_in("ann@uni.edu", "wrong").await.is_err());
        let session = auth.sign_in("ann@uni.edu", "secret1").await.unwrap();
        assert_eq!(session.user.id, user.id);

        auth.delete_user(user.id).await.unwrap();
        assert!(!backend.has_account(&user.id));
        assert!(auth.get_session().await.unwrap().is_none());
    }
}
