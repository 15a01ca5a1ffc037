/// Service layer for the study companion client.
/// Business rules on top of the remote row store and identity provider.

pub mod admin;
pub mod directory;
pub mod session;
pub mod social;

pub use admin::{submit_complaint, AdminConsole};
pub use directory::{name_for, UserDirectory, UserMap};
pub use session::{AuthSessionManager, SessionHandle};
pub use social::{Collection, SocialGraph, SocialState};
