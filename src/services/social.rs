/// Social graph reconciler.
/// Keeps the signed-in user's friends, friend requests, study presence and
/// group feed in sync with the backend. Every mutation is followed by a full
/// re-query of the collection it touched, and realtime change events trigger
/// the same re-queries. Nothing is merged incrementally.
///
/// Loads never fail: errors are logged and the collection is reset to empty.
/// Mutations return domain errors for the caller to show.

use serde_json::json;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::directory::{name_for, UserDirectory};
use super::session::SessionHandle;
use crate::error::{ClientError, Result};
use crate::models::{
    decode_rows, FriendEdge, FriendRequest, FriendRequestStatus, FriendRequestView, FriendView,
    GroupMessage, GroupMessageView, Identity, NewFriendEdge, NewFriendRequest, NewGroupMessage,
    RecordId, StudySession, StudySessionView, StudyStatus, UserId, FEED_WINDOW,
};
use crate::remote::{ChangeEvent, ChangeKind, DataService, Filter, Query, Subscription, Table};

/// The unit of reload and of change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Friends,
    Requests,
    StudySessions,
    GroupMessages,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Friends,
        Collection::Requests,
        Collection::StudySessions,
        Collection::GroupMessages,
    ];
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Collection::Friends => "friends",
            Collection::Requests => "friend requests",
            Collection::StudySessions => "study sessions",
            Collection::GroupMessages => "group messages",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SocialState {
    pub friends: Vec<FriendView>,
    pub incoming_requests: Vec<FriendRequestView>,
    pub outgoing_requests: Vec<FriendRequestView>,
    pub study_sessions: Vec<StudySessionView>,
    pub group_messages: Vec<GroupMessageView>,
}

type Requests = (Vec<FriendRequestView>, Vec<FriendRequestView>);

pub struct SocialGraph<D: DataService> {
    data: Arc<D>,
    directory: UserDirectory<D>,
    session: SessionHandle,
    state: Mutex<SocialState>,
    updates: broadcast::Sender<Collection>,
    realtime: StdMutex<Vec<JoinHandle<()>>>,
    follower: StdMutex<Option<JoinHandle<()>>>,
}

impl<D: DataService> SocialGraph<D> {
    pub fn new(data: Arc<D>, session: SessionHandle) -> Self {
        let (updates, _) = broadcast::channel(64);
        SocialGraph {
            directory: UserDirectory::new(Arc::clone(&data)),
            data,
            session,
            state: Mutex::new(SocialState::default()),
            updates,
            realtime: StdMutex::new(Vec::new()),
            follower: StdMutex::new(None),
        }
    }

    /// Notified with the collection after each reload.
    pub fn updates(&self) -> broadcast::Receiver<Collection> {
        self.updates.subscribe()
    }

    pub async fn snapshot(&self) -> SocialState {
        self.state.lock().await.clone()
    }

    pub async fn friends(&self) -> Vec<FriendView> {
        self.state.lock().await.friends.clone()
    }

    pub async fn incoming_requests(&self) -> Vec<FriendRequestView> {
        self.state.lock().await.incoming_requests.clone()
    }

    pub async fn outgoing_requests(&self) -> Vec<FriendRequestView> {
        self.state.lock().await.outgoing_requests.clone()
    }

    pub async fn study_sessions(&self) -> Vec<StudySessionView> {
        self.state.lock().await.study_sessions.clone()
    }

    pub async fn group_messages(&self) -> Vec<GroupMessageView> {
        self.state.lock().await.group_messages.clone()
    }

    /// Friend matching `token` by id, email, email prefix or name (case
    /// insensitive), from the loaded friend list.
    pub async fn find_friend(&self, token: &str) -> Option<FriendView> {
        let token = token.trim().trim_start_matches('@').to_lowercase();
        if token.is_empty() {
            return None;
        }

        let state = self.state.lock().await;
        state
            .friends
            .iter()
            .find(|f| {
                f.friend_id.to_string() == token
                    || f.name.to_lowercase() == token
                    || f.email.as_deref().is_some_and(|e| {
                        let e = e.to_lowercase();
                        e == token || e.split('@').next() == Some(token.as_str())
                    })
            })
            .cloned()
    }

    /// Store a load result (empty on error) and announce it.
    async fn settle<T: Default>(
        &self,
        collection: Collection,
        fetched: Result<T>,
        apply: impl FnOnce(&mut SocialState, T),
    ) {
        let value = match fetched {
            Ok(value) => value,
            Err(ClientError::NotAuthenticated) => {
                log::debug!("Not signed in, clearing {}", collection);
                T::default()
            }
            Err(e) => {
                log::error!("Failed to load {}: {}", collection, e);
                T::default()
            }
        };

        {
            let mut state = self.state.lock().await;
            apply(&mut state, value);
        }
        let _ = self.updates.send(collection);
    }

    // Loads

    pub async fn load_friends(&self) {
        let fetched = self.fetch_friends().await;
        self.settle(Collection::Friends, fetched, |s, v| s.friends = v).await;
    }

    pub async fn load_friend_requests(&self) {
        let fetched = self.fetch_requests().await;
        self.settle(Collection::Requests, fetched, |s, (incoming, outgoing)| {
            s.incoming_requests = incoming;
            s.outgoing_requests = outgoing;
        })
        .await;
    }

    pub async fn load_study_sessions(&self) {
        let fetched = self.fetch_study_sessions().await;
        self.settle(Collection::StudySessions, fetched, |s, v| s.study_sessions = v).await;
    }

    pub async fn load_group_messages(&self) {
        let fetched = self.fetch_group_messages().await;
        self.settle(Collection::GroupMessages, fetched, |s, v| s.group_messages = v).await;
    }

    pub async fn reload_all(&self) {
        tokio::join!(
            self.load_friends(),
            self.load_friend_requests(),
            self.load_study_sessions(),
            self.load_group_messages(),
        );
    }

    async fn fetch_friends(&self) -> Result<Vec<FriendView>> {
        let me = self.session.require()?;

        let rows = self
            .data
            .select(
                Table::Friends,
                Query::new()
                    .filter(Filter::eq("user_id", me.id))
                    .order_by("created_at", false),
            )
            .await?;
        let edges: Vec<FriendEdge> = decode_rows(rows)?;

        let users = self.directory.lookup(edges.iter().map(|e| e.friend_id)).await?;

        Ok(edges
            .into_iter()
            .map(|edge| FriendView {
                edge_id: edge.id,
                friend_id: edge.friend_id,
                name: name_for(&users, &edge.friend_id),
                email: users.get(&edge.friend_id).and_then(|u| u.email.clone()),
                since: edge.created_at,
            })
            .collect())
    }

    async fn fetch_requests(&self) -> Result<Requests> {
        let me = self.session.require()?;
        let pending = || Filter::eq("status", FriendRequestStatus::Pending.as_str());

        let incoming = self
            .data
            .select(
                Table::FriendRequests,
                Query::new()
                    .filter(Filter::eq("receiver_id", me.id).and(pending()))
                    .order_by("created_at", false),
            )
            .await?;
        let outgoing = self
            .data
            .select(
                Table::FriendRequests,
                Query::new()
                    .filter(Filter::eq("sender_id", me.id).and(pending()))
                    .order_by("created_at", false),
            )
            .await?;

        let incoming: Vec<FriendRequest> = decode_rows(incoming)?;
        let outgoing: Vec<FriendRequest> = decode_rows(outgoing)?;

        let users = self
            .directory
            .lookup(incoming.iter().chain(&outgoing).map(|r| r.counterpart(&me.id)))
            .await?;

        let view = |request: FriendRequest| {
            let other_id = request.counterpart(&me.id);
            FriendRequestView {
                id: request.id,
                sender_id: request.sender_id,
                receiver_id: request.receiver_id,
                other_id,
                other_name: name_for(&users, &other_id),
                other_email: users.get(&other_id).and_then(|u| u.email.clone()),
                created_at: request.created_at,
            }
        };

        Ok((
            incoming.into_iter().map(view).collect(),
            outgoing.into_iter().map(view).collect(),
        ))
    }

    async fn friend_ids(&self, me: &Identity) -> Result<Vec<UserId>> {
        let rows = self
            .data
            .select(
                Table::Friends,
                Query::new()
                    .filter(Filter::eq("user_id", me.id))
                    .order_by("created_at", false),
            )
            .await?;
        let edges: Vec<FriendEdge> = decode_rows(rows)?;
        Ok(edges.into_iter().map(|e| e.friend_id).collect())
    }

    async fn fetch_study_sessions(&self) -> Result<Vec<StudySessionView>> {
        let me = self.session.require()?;

        let mut visible = self.friend_ids(&me).await?;
        visible.push(me.id);

        let rows = self
            .data
            .select(
                Table::StudySessions,
                Query::new()
                    .filter(Filter::in_list("user_id", visible))
                    .order_by("last_active", false),
            )
            .await?;
        let sessions: Vec<StudySession> = decode_rows(rows)?;

        // Our own name comes from the session, not the directory.
        let users = self
            .directory
            .lookup(sessions.iter().map(|s| s.user_id).filter(|id| *id != me.id))
            .await?;

        Ok(sessions
            .into_iter()
            .map(|session| {
                let is_self = session.user_id == me.id;
                StudySessionView {
                    name: if is_self {
                        me.name.clone()
                    } else {
                        name_for(&users, &session.user_id)
                    },
                    user_id: session.user_id,
                    status: session.status,
                    subject: session.subject,
                    started_at: session.started_at,
                    last_active: session.last_active,
                    is_self,
                }
            })
            .collect())
    }

    async fn fetch_group_messages(&self) -> Result<Vec<GroupMessageView>> {
        let me = self.session.require()?;

        let rows = self
            .data
            .select(
                Table::GroupMessages,
                Query::new().order_by("created_at", false).limit(FEED_WINDOW),
            )
            .await?;
        let mut messages: Vec<GroupMessage> = decode_rows(rows)?;
        messages.reverse();

        let users = self
            .directory
            .lookup(messages.iter().map(|m| m.user_id).filter(|id| *id != me.id))
            .await?;

        Ok(messages
            .into_iter()
            .map(|message| {
                let is_own = message.user_id == me.id;
                GroupMessageView {
                    author: if is_own {
                        me.name.clone()
                    } else {
                        name_for(&users, &message.user_id)
                    },
                    mentions_me: message.mentions.contains(&me.id),
                    id: message.id,
                    user_id: message.user_id,
                    message: message.message,
                    mentions: message.mentions,
                    created_at: message.created_at,
                    is_own,
                }
            })
            .collect())
    }

    // Mutations

    async fn fetch_request(&self, id: RecordId) -> Result<Option<FriendRequest>> {
        let rows = self
            .data
            .select(
                Table::FriendRequests,
                Query::new().filter(Filter::eq("id", id)).limit(1),
            )
            .await?;
        Ok(decode_rows::<FriendRequest>(rows)?.into_iter().next())
    }

    /// Whether either directed edge between `a` and `b` exists.
    async fn linked(&self, a: UserId, b: UserId) -> Result<bool> {
        let rows = self
            .data
            .select(
                Table::Friends,
                Query::new()
                    .columns("id")
                    .filter(Filter::pair("user_id", "friend_id", a, b))
                    .limit(1),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn edge_exists(&self, user_id: UserId, friend_id: UserId) -> Result<bool> {
        let rows = self
            .data
            .select(
                Table::Friends,
                Query::new()
                    .columns("id")
                    .filter(Filter::eq("user_id", user_id).and(Filter::eq("friend_id", friend_id)))
                    .limit(1),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Send a friend request to the user registered under `email`.
    pub async fn send_friend_request(&self, email: &str) -> Result<()> {
        let me = self.session.require()?;
        let email = email.trim();
        if email.is_empty() {
            return Err(ClientError::InvalidInput("Enter the email address of the user to add".to_string()));
        }

        let target = self
            .directory
            .find_by_email(email)
            .await?
            .ok_or_else(|| ClientError::UserNotFound(email.to_string()))?;

        if target.id == me.id {
            return Err(ClientError::SelfRequest);
        }

        if self.linked(me.id, target.id).await? {
            return Err(ClientError::AlreadyFriends);
        }

        let pending = self
            .data
            .select(
                Table::FriendRequests,
                Query::new()
                    .columns("id")
                    .filter(
                        Filter::pair("sender_id", "receiver_id", me.id, target.id)
                            .and(Filter::eq("status", FriendRequestStatus::Pending.as_str())),
                    )
                    .limit(1),
            )
            .await?;
        if !pending.is_empty() {
            return Err(ClientError::RequestPending);
        }

        let row = serde_json::to_value(NewFriendRequest::pending(me.id, target.id))?;
        match self.data.insert(Table::FriendRequests, vec![row]).await {
            Ok(_) => {}
            // Another request for the pair landed between the check and the insert.
            Err(ClientError::Conflict(_)) => return Err(ClientError::RequestPending),
            Err(e) => return Err(e),
        }

        log::info!("Friend request sent from {} to {}", me.email, email);
        self.load_friend_requests().await;
        Ok(())
    }

    /// Accept an incoming request. Safe to retry: edges that already exist
    /// are left alone and an accepted request stays accepted.
    pub async fn accept_friend_request(&self, id: RecordId) -> Result<()> {
        let me = self.session.require()?;

        let request = self
            .fetch_request(id)
            .await?
            .filter(|r| r.receiver_id == me.id)
            .ok_or_else(|| ClientError::RequestNotFound(id.to_string()))?;

        if request.status == FriendRequestStatus::Rejected {
            return Err(ClientError::RequestClosed(id.to_string()));
        }

        let mut missing = Vec::new();
        for (user_id, friend_id) in [
            (request.sender_id, request.receiver_id),
            (request.receiver_id, request.sender_id),
        ] {
            if !self.edge_exists(user_id, friend_id).await? {
                missing.push(serde_json::to_value(NewFriendEdge { user_id, friend_id })?);
            }
        }

        if !missing.is_empty() {
            match self.data.insert(Table::Friends, missing).await {
                Ok(_) => {}
                Err(ClientError::Conflict(e)) => {
                    log::debug!("Friend edge for request {} already present: {}", id, e);
                }
                Err(e) => return Err(e),
            }
        }

        if request.status == FriendRequestStatus::Pending {
            let updated = self
                .data
                .update(
                    Table::FriendRequests,
                    json!({ "status": FriendRequestStatus::Accepted }),
                    Filter::eq("id", id).and(Filter::eq("status", FriendRequestStatus::Pending.as_str())),
                )
                .await?;
            if updated.is_empty() {
                log::debug!("Friend request {} was closed before it could be marked accepted", id);
            }
        }

        log::info!("Accepted friend request {} from {}", id, request.sender_id);
        // Presence visibility follows the friend set.
        tokio::join!(
            self.load_friends(),
            self.load_friend_requests(),
            self.load_study_sessions(),
        );
        Ok(())
    }

    /// Decline an incoming request. Friend edges are not touched.
    pub async fn reject_friend_request(&self, id: RecordId) -> Result<()> {
        let me = self.session.require()?;

        let request = self
            .fetch_request(id)
            .await?
            .filter(|r| r.receiver_id == me.id)
            .ok_or_else(|| ClientError::RequestNotFound(id.to_string()))?;

        if request.status != FriendRequestStatus::Pending {
            return Err(ClientError::RequestClosed(id.to_string()));
        }

        let updated = self
            .data
            .update(
                Table::FriendRequests,
                json!({ "status": FriendRequestStatus::Rejected }),
                Filter::eq("id", id).and(Filter::eq("status", FriendRequestStatus::Pending.as_str())),
            )
            .await?;
        if updated.is_empty() {
            return Err(ClientError::RequestClosed(id.to_string()));
        }

        log::info!("Rejected friend request {} from {}", id, request.sender_id);
        self.load_friend_requests().await;
        Ok(())
    }

    /// Remove both directed edges between the caller and `friend_id`.
    pub async fn remove_friend(&self, friend_id: UserId) -> Result<()> {
        let me = self.session.require()?;

        let removed = self
            .data
            .delete(
                Table::Friends,
                Filter::pair("user_id", "friend_id", me.id, friend_id),
            )
            .await?;

        log::info!("Removed {} friend edge(s) between {} and {}", removed, me.id, friend_id);
        tokio::join!(self.load_friends(), self.load_study_sessions());
        Ok(())
    }

    /// Set the caller's presence, creating the row on first use.
    pub async fn update_study_status(&self, status: StudyStatus, subject: Option<String>) -> Result<()> {
        let me = self.session.require()?;

        let row = serde_json::to_value(StudySession::now(me.id, status, subject))?;
        self.data.upsert(Table::StudySessions, row, "user_id").await?;

        log::debug!("Study status of {} set to {}", me.email, status);
        self.load_study_sessions().await;
        Ok(())
    }

    /// Post to the group feed. The feed is refreshed by the insert event, not
    /// here.
    pub async fn send_group_message(&self, message: &str, mentions: Vec<UserId>) -> Result<()> {
        let me = self.session.require()?;
        let message = message.trim();
        if message.is_empty() {
            return Err(ClientError::InvalidInput("Message cannot be empty".to_string()));
        }

        let mut mentions = mentions;
        mentions.sort();
        mentions.dedup();

        let row = serde_json::to_value(NewGroupMessage {
            user_id: me.id,
            message: message.to_string(),
            mentions,
        })?;
        self.data.insert(Table::GroupMessages, vec![row]).await?;
        Ok(())
    }

    // Realtime

    async fn apply_change(&self, event: &ChangeEvent) {
        log::debug!("{:?} on {}", event.kind, event.table);
        match event.table {
            Table::FriendRequests => {
                tokio::join!(
                    self.load_friend_requests(),
                    self.load_friends(),
                    self.load_study_sessions(),
                );
            }
            Table::StudySessions => self.load_study_sessions().await,
            Table::GroupMessages => self.load_group_messages().await,
            _ => {}
        }
    }

    fn spawn_listener(graph: Weak<Self>, mut subscription: Subscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                let Some(graph) = graph.upgrade() else { break };
                graph.apply_change(&event).await;
            }
            log::debug!("Change stream for {} ended", subscription.table());
        })
    }

    /// Subscribe to the three tables the views depend on. Replaces any
    /// earlier subscriptions.
    pub async fn start_realtime(self: &Arc<Self>) -> Result<()> {
        self.stop_realtime();

        let plan: [(Table, &[ChangeKind]); 3] = [
            (Table::FriendRequests, &ChangeKind::ALL),
            (Table::StudySessions, &ChangeKind::ALL),
            (Table::GroupMessages, &[ChangeKind::Insert]),
        ];

        let mut listeners = Vec::with_capacity(plan.len());
        for (table, kinds) in plan {
            match self.data.subscribe(table, kinds).await {
                Ok(subscription) => {
                    listeners.push(Self::spawn_listener(Arc::downgrade(self), subscription));
                }
                Err(e) => {
                    for listener in listeners {
                        listener.abort();
                    }
                    return Err(e);
                }
            }
        }

        if let Ok(mut slot) = self.realtime.lock() {
            for stale in slot.drain(..) {
                stale.abort();
            }
            *slot = listeners;
        }
        log::debug!("Realtime listeners started");
        Ok(())
    }

    pub fn stop_realtime(&self) {
        if let Ok(mut slot) = self.realtime.lock() {
            for listener in slot.drain(..) {
                listener.abort();
            }
        }
    }

    async fn on_identity(self: &Arc<Self>, identity: Option<Identity>) {
        match identity {
            Some(identity) => {
                log::info!("Loading social graph for {}", identity.email);
                self.reload_all().await;
                if let Err(e) = self.start_realtime().await {
                    log::error!("Failed to start realtime updates: {}", e);
                }
            }
            None => {
                self.stop_realtime();
                *self.state.lock().await = SocialState::default();
                for collection in Collection::ALL {
                    let _ = self.updates.send(collection);
                }
            }
        }
    }

    /// Reload and resubscribe whenever the signed-in identity changes; clear
    /// everything on sign-out.
    pub fn follow_session(self: &Arc<Self>) {
        let graph = Arc::downgrade(self);
        let mut session = self.session.clone();

        let follower = tokio::spawn(async move {
            let mut identity = session.latest();
            loop {
                match graph.upgrade() {
                    Some(graph) => graph.on_identity(identity).await,
                    None => break,
                }
                identity = match session.changed().await {
                    Ok(identity) => identity,
                    Err(_) => break,
                };
            }
        });

        if let Ok(mut slot) = self.follower.lock() {
            if let Some(previous) = slot.replace(follower) {
                previous.abort();
            }
        }
    }

    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.follower.lock() {
            if let Some(follower) = slot.take() {
                follower.abort();
            }
        }
        self.stop_realtime();
    }
}

impl<D: DataService> Drop for SocialGraph<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryBackend;

    fn graph_for(backend: &MemoryBackend, identity: Option<Identity>) -> SocialGraph<MemoryBackend> {
        SocialGraph::new(Arc::new(backend.clone()), SessionHandle::fixed(identity))
    }

    fn someone() -> Identity {
        Identity {
            id: UserId::new(),
            email: "me@uni.edu".to_string(),
            name: "Me".to_string(),
        }
    }

    #[tokio::test]
    async fn test_loads_without_identity_are_empty() {
        let graph = graph_for(&MemoryBackend::new(), None);
        graph.reload_all().await;
        assert_eq!(graph.snapshot().await, SocialState::default());
    }

    #[tokio::test]
    async fn test_mutations_require_identity() {
        let graph = graph_for(&MemoryBackend::new(), None);
        let err = graph.send_group_message("hi", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_reload_announces_collection() {
        let graph = graph_for(&MemoryBackend::new(), Some(someone()));
        let mut updates = graph.updates();

        graph.load_study_sessions().await;
        assert_eq!(updates.recv().await.unwrap(), Collection::StudySessions);
    }

    #[tokio::test]
    async fn test_own_presence_uses_session_name() {
        let backend = MemoryBackend::new();
        let me = someone();
        let graph = graph_for(&backend, Some(me.clone()));

        graph
            .update_study_status(StudyStatus::Studying, Some("Algebra".to_string()))
            .await
            .unwrap();

        let sessions = graph.study_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "Me");
        assert!(sessions[0].is_self);
        assert_eq!(sessions[0].subject.as_deref(), Some("Algebra"));
    }
}
