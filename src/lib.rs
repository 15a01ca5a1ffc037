/// Study Companion Client Library
/// Friends, study presence, group chat and complaint triage on top of a
/// hosted backend.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod remote;
pub mod services;
pub mod storage;

pub use client::StudyClient;
pub use error::{ClientError, Result};
pub use services::{AdminConsole, AuthSessionManager, SessionHandle, SocialGraph};
