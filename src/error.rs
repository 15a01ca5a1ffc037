/// Error types for the study companion client.
/// Infrastructure failures and domain rule violations share one enum so every
/// service returns the same `Result`.

use std::io;
use thiserror::Error;

/// Message shown for anything that is not a domain rule violation.
pub const GENERIC_FAILURE: &str = "Something went wrong. Please try again.";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("State error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    // Domain rule violations, safe to show verbatim.
    #[error("No user is registered with the email {0}")]
    UserNotFound(String),

    #[error("You cannot send a friend request to yourself")]
    SelfRequest,

    #[error("You are already friends with this user")]
    AlreadyFriends,

    #[error("A friend request is already pending between you and this user")]
    RequestPending,

    #[error("Friend request {0} was not found")]
    RequestNotFound(String),

    #[error("Friend request {0} has already been closed")]
    RequestClosed(String),

    #[error("You must be signed in to do that")]
    NotAuthenticated,

    #[error("{0}")]
    InvalidInput(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Only administrators can do that")]
    NotAdmin,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Complaint {0} has already been resolved")]
    AlreadyResolved(String),
}

impl ClientError {
    /// True for business-rule violations meant to be displayed as-is.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            ClientError::UserNotFound(_)
                | ClientError::SelfRequest
                | ClientError::AlreadyFriends
                | ClientError::RequestPending
                | ClientError::RequestNotFound(_)
                | ClientError::RequestClosed(_)
                | ClientError::NotAuthenticated
                | ClientError::InvalidInput(_)
                | ClientError::Registration(_)
                | ClientError::NotAdmin
                | ClientError::NotFound(_)
                | ClientError::AlreadyResolved(_)
        )
    }

    /// Text suitable for direct display. Transport and infrastructure
    /// failures collapse to a generic message.
    pub fn user_message(&self) -> String {
        if self.is_domain() {
            self.to_string()
        } else {
            GENERIC_FAILURE.to_string()
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
