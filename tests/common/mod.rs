#![allow(dead_code)]

/// Common test utilities and helpers for integration tests
/// Every test runs against its own in-process backend; each simulated user
/// gets a separate auth client, session manager and social graph on top of it.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use study_companion::error::Result;
use study_companion::models::{
    ComplaintPriority, ComplaintStatus, Identity, NewFriendEdge, RecordId, UserId,
};
use study_companion::remote::{DataService, MemoryAuth, MemoryBackend, Table};
use study_companion::services::{AdminConsole, AuthSessionManager, SocialGraph};

/// Test context holding the shared backend
pub struct TestContext {
    pub backend: MemoryBackend,
}

impl TestContext {
    pub fn new() -> Self {
        TestContext {
            backend: MemoryBackend::new(),
        }
    }

    pub fn data(&self) -> Arc<MemoryBackend> {
        Arc::new(self.backend.clone())
    }

    /// A fresh client (auth + session manager + graph) with nobody signed in
    pub fn client(&self) -> TestUser {
        let auth = Arc::new(MemoryAuth::new(self.backend.clone()));
        let session = AuthSessionManager::new(Arc::clone(&auth), self.data());
        let graph = Arc::new(SocialGraph::new(self.data(), session.handle()));
        TestUser {
            identity: None,
            auth,
            session,
            graph,
        }
    }

    /// Register and sign in a user
    pub async fn user(&self, name: &str, email: &str) -> Result<TestUser> {
        TestUserBuilder::new().name(name).email(email).register(self).await
    }

    /// Insert a profile row without an auth identity
    pub async fn profile(&self, name: Option<&str>, email: Option<&str>) -> UserId {
        let id = UserId::new();
        self.backend
            .insert(Table::Users, vec![json!({ "id": id, "name": name, "email": email })])
            .await
            .expect("Failed to insert profile");
        id
    }

    /// Insert one directed friend edge
    pub async fn edge(&self, user_id: UserId, friend_id: UserId) {
        let row = serde_json::to_value(NewFriendEdge { user_id, friend_id }).unwrap();
        self.backend
            .insert(Table::Friends, vec![row])
            .await
            .expect("Failed to insert friend edge");
    }

    /// Make `a` and `b` friends through the request flow
    pub async fn befriend(&self, a: &TestUser, b: &TestUser) -> Result<()> {
        a.graph.send_friend_request(&email_of(b)).await?;
        b.graph.load_friend_requests().await;
        let request = b
            .graph
            .incoming_requests()
            .await
            .into_iter()
            .find(|r| r.sender_id == a.id())
            .expect("request should be visible to the receiver");
        b.graph.accept_friend_request(request.id).await
    }

    pub fn admin_console(&self, user: &TestUser, admins: &[&str]) -> AdminConsole<MemoryBackend> {
        AdminConsole::new(
            self.data(),
            user.session.handle(),
            admins.iter().map(|a| a.to_string()),
        )
    }

    pub fn friend_edges(&self) -> Vec<(UserId, UserId)> {
        self.backend
            .rows(Table::Friends)
            .iter()
            .map(|row| {
                (
                    serde_json::from_value(row["user_id"].clone()).unwrap(),
                    serde_json::from_value(row["friend_id"].clone()).unwrap(),
                )
            })
            .collect()
    }

    pub fn request_statuses(&self) -> Vec<String> {
        self.backend
            .rows(Table::FriendRequests)
            .iter()
            .map(|row| row["status"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

fn email_of(user: &TestUser) -> String {
    user.identity
        .as_ref()
        .map(|i| i.email.clone())
        .expect("user should be signed in")
}

/// One simulated client
pub struct TestUser {
    pub identity: Option<Identity>,
    pub auth: Arc<MemoryAuth>,
    pub session: AuthSessionManager<MemoryAuth, MemoryBackend>,
    pub graph: Arc<SocialGraph<MemoryBackend>>,
}

impl TestUser {
    pub fn id(&self) -> UserId {
        self.identity.as_ref().map(|i| i.id).expect("user should be signed in")
    }

    pub fn email(&self) -> String {
        email_of(self)
    }
}

/// Helper for creating registered users
pub struct TestUserBuilder {
    name: String,
    email: String,
    password: String,
    institution: Option<String>,
}

impl Default for TestUserBuilder {
    fn default() -> Self {
        TestUserBuilder {
            name: "Test User".to_string(),
            email: "test@uni.edu".to_string(),
            password: "secret123".to_string(),
            institution: None,
        }
    }
}

impl TestUserBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn email(mut self, email: &str) -> Self {
        self.email = email.to_string();
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn institution(mut self, institution: &str) -> Self {
        self.institution = Some(institution.to_string());
        self
    }

    pub async fn register(self, ctx: &TestContext) -> Result<TestUser> {
        let mut user = ctx.client();
        let identity = user
            .session
            .register(&self.name, &self.email, &self.password, self.institution.as_deref(), None)
            .await?;
        user.identity = Some(identity);
        Ok(user)
    }
}

/// Helper for creating group message rows with explicit timestamps
pub struct TestMessageBuilder {
    user_id: UserId,
    message: String,
    mentions: Vec<UserId>,
    created_at: DateTime<Utc>,
}

impl TestMessageBuilder {
    pub fn new(user_id: UserId) -> Self {
        TestMessageBuilder {
            user_id,
            message: "test message".to_string(),
            mentions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    pub fn mentions(mut self, mentions: Vec<UserId>) -> Self {
        self.mentions = mentions;
        self
    }

    pub fn minutes_ago(mut self, minutes: i64) -> Self {
        self.created_at = Utc::now() - Duration::minutes(minutes);
        self
    }

    pub fn build(self) -> Value {
        json!({
            "id": RecordId::new(),
            "user_id": self.user_id,
            "message": self.message,
            "mentions": self.mentions,
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}

/// Helper for creating complaint rows
pub struct TestComplaintBuilder {
    email: String,
    subject: String,
    priority: ComplaintPriority,
    status: ComplaintStatus,
    created_at: DateTime<Utc>,
}

impl Default for TestComplaintBuilder {
    fn default() -> Self {
        TestComplaintBuilder {
            email: "student@uni.edu".to_string(),
            subject: "Something broke".to_string(),
            priority: ComplaintPriority::Normal,
            status: ComplaintStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

impl TestComplaintBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    pub fn priority(mut self, priority: ComplaintPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn status(mut self, status: ComplaintStatus) -> Self {
        self.status = status;
        self
    }

    pub fn minutes_ago(mut self, minutes: i64) -> Self {
        self.created_at = Utc::now() - Duration::minutes(minutes);
        self
    }

    pub fn build(self) -> Value {
        json!({
            "id": RecordId::new(),
            "email": self.email,
            "subject": self.subject,
            "message": "details",
            "priority": self.priority,
            "status": self.status,
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}

/// Poll `check` until it holds or about a second has passed
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
