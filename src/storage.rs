/// Local persistence for the auth session
///
/// One row per backend profile (the backend URL), so a client pointed at
/// several deployments keeps each sign-in separately.

use crate::error::{ClientError, Result};
use crate::models::{AuthUser, ProfileMetadata, Session, UserId};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) the session database at the given path
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::initialize(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn initialize(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                profile TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                email TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ClientError::Storage("session store lock poisoned".to_string()))
    }

    /// Save the session for a profile, replacing any previous one
    pub fn save(&self, profile: &str, session: &Session) -> Result<()> {
        let metadata_json = serde_json::to_string(&session.user.metadata)?;
        let updated_at = Utc::now().to_rfc3339();

        self.conn()?.execute(
            "INSERT OR REPLACE INTO sessions (profile, user_id, email, access_token, refresh_token, expires_at, metadata_json, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            (
                profile,
                session.user.id.to_string(),
                &session.user.email,
                &session.access_token,
                &session.refresh_token,
                session.expires_at.to_rfc3339(),
                metadata_json,
                updated_at,
            ),
        )?;

        log::debug!("Saved session for {} ({})", session.user.email, profile);
        Ok(())
    }

    /// Load the session for a profile, if one was saved
    pub fn load(&self, profile: &str) -> Result<Option<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, email, access_token, refresh_token, expires_at, metadata_json FROM sessions WHERE profile = ?1",
        )?;

        let row = stmt
            .query_row((profile,), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .optional()?;

        let Some((user_id, email, access_token, refresh_token, expires_at, metadata_json)) = row else {
            return Ok(None);
        };

        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map_err(|e| ClientError::Storage(format!("bad expiry in stored session: {}", e)))?
            .with_timezone(&Utc);
        let metadata: ProfileMetadata = serde_json::from_str(&metadata_json)?;

        Ok(Some(Session {
            access_token,
            refresh_token,
            expires_at,
            user: AuthUser {
                id: UserId::parse(&user_id)?,
                email,
                metadata,
            },
        }))
    }

    /// Forget the session for a profile
    pub fn clear(&self, profile: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM sessions WHERE profile = ?1", (profile,))?;
        Ok(())
    }
}
