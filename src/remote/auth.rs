/// Auth client for the backend's GoTrue-style endpoint.
/// Publishes every session change, shares the access token with the row and
/// realtime clients, and persists the session so a restart can resume it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::rest::{error_for_status, BackendConfig, TokenSlot};
use super::AuthService;
use crate::error::{ClientError, Result};
use crate::models::{AuthUser, ProfileMetadata, Session, UserId};
use crate::storage::SessionStore;

/// Refresh this long before the access token expires.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| self.expires_in.map(|secs| Utc::now() + ChronoDuration::seconds(secs)))
            .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(1));

        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

pub struct RestAuth {
    config: BackendConfig,
    client: Client,
    tokens: TokenSlot,
    store: Option<SessionStore>,
    session: watch::Sender<Option<Session>>,
}

impl RestAuth {
    pub fn new(config: BackendConfig, tokens: TokenSlot, store: Option<SessionStore>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let (session, _) = watch::channel(None);

        Ok(RestAuth {
            config,
            client,
            tokens,
            store,
            session,
        })
    }

    fn profile(&self) -> &str {
        self.config.url.as_str()
    }

    /// Make `session` current everywhere: token slot, local store, watchers.
    fn publish(&self, session: Option<Session>) {
        self.tokens.set(session.as_ref().map(|s| s.access_token.clone()));

        if let Some(store) = &self.store {
            let persisted = match &session {
                Some(s) => store.save(self.profile(), s),
                None => store.clear(self.profile()),
            };
            if let Err(e) = persisted {
                log::warn!("Failed to persist session: {}", e);
            }
        }

        self.session.send_replace(session);
    }

    async fn token_request(&self, grant_type: &str, body: Value) -> Result<Session> {
        let url = self.config.auth_url(&format!("token?grant_type={}", grant_type))?;
        let response = self
            .client
            .post(url)
            .header("apikey", &self.config.anon_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match error_for_status(status, &body, "sign in") {
                ClientError::Server(m) if status == StatusCode::BAD_REQUEST => ClientError::Auth(m),
                other => other,
            });
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.into_session())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let session = self
            .token_request("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        log::debug!("Refreshed session for {}", session.user.email);
        Ok(session)
    }

    /// Keep the session fresh in the background: refresh shortly before each
    /// expiry, follow sign-ins and sign-outs.
    pub fn spawn_auto_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let auth = Arc::downgrade(self);
        let mut changes = self.session.subscribe();

        tokio::spawn(async move {
            loop {
                let expires_at = changes.borrow_and_update().as_ref().map(|s| s.expires_at);
                let Some(expires_at) = expires_at else {
                    if changes.changed().await.is_err() {
                        break;
                    }
                    continue;
                };

                let wait = (expires_at - ChronoDuration::seconds(REFRESH_MARGIN_SECS) - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        let Some(auth) = auth.upgrade() else { break };
                        if let Err(e) = auth.get_session().await {
                            log::warn!("Background session refresh failed: {}", e);
                        }
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl AuthService for RestAuth {
    async fn get_session(&self) -> Result<Option<Session>> {
        let current = self.session.borrow().clone();
        let candidate = match current {
            Some(session) => Some(session),
            None => match &self.store {
                Some(store) => store.load(self.profile())?,
                None => None,
            },
        };

        let Some(session) = candidate else {
            return Ok(None);
        };

        if !session.expires_within(ChronoDuration::seconds(REFRESH_MARGIN_SECS)) {
            if self.session.borrow().as_ref() != Some(&session) {
                self.publish(Some(session.clone()));
            }
            return Ok(Some(session));
        }

        match self.refresh(&session.refresh_token).await {
            Ok(fresh) => {
                self.publish(Some(fresh.clone()));
                Ok(Some(fresh))
            }
            Err(e) => {
                log::warn!("Session for {} could not be refreshed: {}", session.user.email, e);
                self.publish(None);
                Ok(None)
            }
        }
    }

    fn on_session_change(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let session = self
            .token_request("password", json!({ "email": email.trim(), "password": password }))
            .await?;
        log::info!("Signed in as {}", session.user.email);
        self.publish(Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: ProfileMetadata) -> Result<AuthUser> {
        let response = self
            .client
            .post(self.config.auth_url("signup")?)
            .header("apikey", &self.config.anon_key)
            .json(&json!({ "email": email.trim(), "password": password, "data": metadata }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match error_for_status(status, &body, "sign up") {
                ClientError::Server(m) if status.is_client_error() => ClientError::Auth(m),
                other => other,
            });
        }

        // Auto-confirmed projects answer with a full session, others with
        // just the user (sometimes wrapped).
        let body: Value = response.json().await?;
        if body.get("access_token").is_some() {
            let session = serde_json::from_value::<TokenResponse>(body)?.into_session();
            let user = session.user.clone();
            self.publish(Some(session));
            return Ok(user);
        }

        let user = match body.get("user") {
            Some(user) if user.is_object() => serde_json::from_value(user.clone())?,
            _ => serde_json::from_value(body)?,
        };
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        let outcome = match self.tokens.get() {
            Some(token) => {
                let response = self
                    .client
                    .post(self.config.auth_url("logout")?)
                    .header("apikey", &self.config.anon_key)
                    .bearer_auth(token)
                    .send()
                    .await;
                match response {
                    Ok(r) if r.status().is_success() => Ok(()),
                    Ok(r) => {
                        let status = r.status();
                        let body = r.text().await.unwrap_or_default();
                        Err(error_for_status(status, &body, "sign out"))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            None => Ok(()),
        };

        // The local session ends even if the server could not be told.
        self.publish(None);
        outcome
    }

    async fn delete_user(&self, id: UserId) -> Result<()> {
        let service_key = self.config.service_key.clone().ok_or_else(|| {
            ClientError::Config("deleting an auth identity requires a service key".to_string())
        })?;

        let response = self
            .client
            .delete(self.config.auth_url(&format!("admin/users/{}", id))?)
            .header("apikey", &service_key)
            .bearer_auth(&service_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body, "delete user"));
        }

        log::info!("Deleted auth identity {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_prefers_absolute_expiry() {
        let token: TokenResponse = serde_json::from_value(json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_in": 3600,
            "expires_at": 1_900_000_000,
            "user": { "id": UserId::new().to_string(), "email": "x@y.z" }
        }))
        .unwrap();

        let session = token.into_session();
        assert_eq!(session.expires_at.timestamp(), 1_900_000_000);
    }

    #[test]
    fn test_token_response_falls_back_to_relative_expiry() {
        let token: TokenResponse = serde_json::from_value(json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_in": 3600,
            "user": { "id": UserId::new().to_string(), "email": "x@y.z" }
        }))
        .unwrap();

        let session = token.into_session();
        assert!(!session.expires_within(ChronoDuration::minutes(59)));
        assert!(session.expires_within(ChronoDuration::minutes(61)));
    }

    #[tokio::test]
    async fn test_persisted_session_is_restored() {
        let store = SessionStore::in_memory().unwrap();
        let config = BackendConfig::new("http://localhost:54321", "anon").unwrap();
        let session = Session {
            access_token: "jwt".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
            user: AuthUser {
                id: UserId::new(),
                email: "kim@uni.edu".to_string(),
                metadata: ProfileMetadata::default(),
            },
        };
        store.save(config.url.as_str(), &session).unwrap();

        let tokens = TokenSlot::default();
        let auth = RestAuth::new(config, tokens.clone(), Some(store)).unwrap();
        let restored = auth.get_session().await.unwrap().unwrap();

        assert_eq!(restored.user.email, "kim@uni.edu");
        assert_eq!(tokens.get().as_deref(), Some("jwt"));
        assert!(auth.on_session_change().borrow().is_some());
    }

    #[tokio::test]
    async fn test_delete_user_requires_service_key() {
        let config = BackendConfig::new("http://localhost:54321", "anon").unwrap();
        let auth = RestAuth::new(config, TokenSlot::default(), None).unwrap();

        let err = auth.delete_user(UserId::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }
}
