/// Auth session manager.
/// Owns the mapping from auth sessions to the signed-in `Identity` and hands
/// out `SessionHandle`s so other services can read it and follow changes.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ClientError, Result};
use crate::models::{Identity, ProfileMetadata, Session, UserProfile};
use crate::remote::{AuthService, DataService, Table};

const MIN_PASSWORD_LEN: usize = 6;

/// Read side of the current identity.
#[derive(Clone)]
pub struct SessionHandle {
    rx: watch::Receiver<Option<Identity>>,
}

impl SessionHandle {
    /// Handle pinned to a fixed identity; it never changes.
    pub fn fixed(identity: Option<Identity>) -> Self {
        let (_, rx) = watch::channel(identity);
        SessionHandle { rx }
    }

    pub fn current(&self) -> Option<Identity> {
        self.rx.borrow().clone()
    }

    /// Current identity, or `NotAuthenticated`.
    pub fn require(&self) -> Result<Identity> {
        self.current().ok_or(ClientError::NotAuthenticated)
    }

    /// Current identity, marking it as seen for `changed`.
    pub fn latest(&mut self) -> Option<Identity> {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the identity to change and return the new one. Fails once the
    /// manager is gone.
    pub async fn changed(&mut self) -> Result<Option<Identity>> {
        self.rx
            .changed()
            .await
            .map_err(|_| ClientError::State("session manager shut down".to_string()))?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

/// Publish `next` only if it differs from the current identity.
fn publish(identity: &watch::Sender<Option<Identity>>, next: Option<Identity>) -> bool {
    identity.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    })
}

pub struct AuthSessionManager<A: AuthService, D: DataService> {
    auth: Arc<A>,
    data: Arc<D>,
    identity: Arc<watch::Sender<Option<Identity>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<A: AuthService, D: DataService> AuthSessionManager<A, D> {
    pub fn new(auth: Arc<A>, data: Arc<D>) -> Self {
        let (identity, _) = watch::channel(None);
        AuthSessionManager {
            auth,
            data,
            identity: Arc::new(identity),
            listener: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            rx: self.identity.subscribe(),
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    /// Probe for an existing session, then follow auth changes until
    /// `shutdown`.
    pub async fn initialize(&self) -> Option<Identity> {
        let mut changes = self.auth.on_session_change();

        let session = match self.auth.get_session().await {
            Ok(session) => session,
            Err(e) => {
                log::warn!("Session probe failed: {}", e);
                None
            }
        };
        changes.borrow_and_update();
        let identity = session.as_ref().map(Session::identity);
        publish(&self.identity, identity.clone());

        if let Some(identity) = &identity {
            log::info!("Resumed session for {}", identity.email);
        }

        let target = Arc::clone(&self.identity);
        let listener = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let next = changes.borrow_and_update().as_ref().map(Session::identity);
                if publish(&target, next.clone()) {
                    match next {
                        Some(identity) => log::debug!("Identity changed to {}", identity.email),
                        None => log::debug!("Identity cleared"),
                    }
                }
            }
        });

        if let Ok(mut slot) = self.listener.lock() {
            if let Some(previous) = slot.replace(listener) {
                previous.abort();
            }
        }

        identity
    }

    /// Sign in. Failures are logged, not returned.
    pub async fn login(&self, email: &str, password: &str) -> bool {
        match self.auth.sign_in(email.trim(), password).await {
            Ok(session) => {
                publish(&self.identity, Some(session.identity()));
                true
            }
            Err(e) => {
                log::warn!("Login failed for {}: {}", email.trim(), e);
                false
            }
        }
    }

    /// Create an auth identity plus its profile row. If the profile cannot be
    /// written the identity is deleted again so a retry starts clean.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
        institution: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Identity> {
        let name = name.trim();
        let email = email.trim();
        let institution = institution.map(str::trim).filter(|s| !s.is_empty());
        let phone = phone.map(str::trim).filter(|s| !s.is_empty());

        if name.is_empty() {
            return Err(ClientError::InvalidInput("Name is required".to_string()));
        }
        if !email.contains('@') {
            return Err(ClientError::InvalidInput(format!("'{}' is not a valid email address", email)));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ClientError::InvalidInput(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let metadata = ProfileMetadata {
            name: Some(name.to_string()),
            institution: institution.map(str::to_string),
            phone: phone.map(str::to_string),
        };

        let user = self
            .auth
            .sign_up(email, password, metadata)
            .await
            .map_err(|e| {
                log::warn!("Sign-up failed for {}: {}", email, e);
                match e {
                    ClientError::Auth(message) => ClientError::Registration(message),
                    other => ClientError::Registration(other.user_message()),
                }
            })?;

        let profile = UserProfile {
            id: user.id,
            name: Some(name.to_string()),
            email: Some(user.email.to_lowercase()),
            institution: institution.map(str::to_string),
            phone: phone.map(str::to_string),
            created_at: None,
        };

        let inserted = match serde_json::to_value(&profile) {
            Ok(row) => self.data.insert(Table::Users, vec![row]).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };

        if let Err(e) = inserted {
            log::error!("Failed to create profile for {}: {}", email, e);
            if let Err(rollback) = self.auth.delete_user(user.id).await {
                log::error!("Failed to roll back auth identity {}: {}", user.id, rollback);
            }
            if let Err(signout) = self.auth.sign_out().await {
                log::warn!("Sign-out after failed registration failed: {}", signout);
            }
            publish(&self.identity, None);
            return Err(ClientError::Registration(
                "Your profile could not be created. Please try again.".to_string(),
            ));
        }

        log::info!("Registered {} ({})", user.email, user.id);

        let signed_in = self
            .auth
            .on_session_change()
            .borrow()
            .as_ref()
            .map(Session::identity);
        if signed_in.as_ref().map(|i| i.id) == Some(user.id) {
            publish(&self.identity, signed_in);
        }

        Ok(Identity::from(&user))
    }

    /// Sign out. The local identity is cleared even if the backend call fails.
    pub async fn logout(&self) -> Result<()> {
        let result = self.auth.sign_out().await;
        publish(&self.identity, None);
        if let Err(e) = &result {
            log::warn!("Sign-out failed: {}", e);
        }
        result
    }

    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.listener.lock() {
            if let Some(listener) = slot.take() {
                listener.abort();
            }
        }
    }
}

impl<A: AuthService, D: DataService> Drop for AuthSessionManager<A, D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
