/// Configuration for the study companion terminal client.
/// Every option can also come from a `STUDY_*` environment variable.

use clap::Parser;
use directories::BaseDirs;
use std::path::PathBuf;

use crate::error::{ClientError, Result};
use crate::remote::BackendConfig;

/// Session database file inside the state directory.
pub const STATE_DB: &str = "session.db";

#[derive(Parser, Debug, Clone)]
#[command(name = "study-client")]
#[command(about = "Study companion - friends, study presence and group chat", long_about = None)]
pub struct Config {
    /// Backend base URL
    #[arg(long, env = "STUDY_URL", default_value = "http://localhost:54321")]
    pub url: String,

    /// Public (anon) API key
    #[arg(long, env = "STUDY_ANON_KEY", default_value = "")]
    pub anon_key: String,

    /// Service key, needed only to roll back a failed registration
    #[arg(long, env = "STUDY_SERVICE_KEY", hide_env_values = true)]
    pub service_key: Option<String>,

    /// Directory for the session database (default: ~/.studycompanion)
    #[arg(long, env = "STUDY_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Email allowed to use the admin commands (repeatable)
    #[arg(long = "admin", env = "STUDY_ADMINS", value_delimiter = ',')]
    pub admins: Vec<String>,

    /// Run against an in-process backend instead of the network
    #[arg(long, env = "STUDY_OFFLINE")]
    pub offline: bool,

    /// Enable verbose logging (DEBUG level)
    #[arg(short, long, env = "STUDY_VERBOSE")]
    pub verbose: bool,
}

impl Config {
    /// Parse command-line arguments into Config
    pub fn from_args() -> Self {
        Config::parse()
    }

    /// State directory, defaulting to `~/.studycompanion`
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }

        let base_dirs = BaseDirs::new()
            .ok_or_else(|| ClientError::Config("Failed to get home directory".to_string()))?;
        Ok(base_dirs.home_dir().join(".studycompanion"))
    }

    pub fn state_db(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join(STATE_DB))
    }

    pub fn backend(&self) -> Result<BackendConfig> {
        Ok(BackendConfig::new(&self.url, &self.anon_key)?.with_service_key(self.service_key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["study-client"]).unwrap();
        assert_eq!(config.url, "http://localhost:54321");
        assert!(config.admins.is_empty());
        assert!(!config.offline);
        assert!(!config.verbose);
    }

    #[test]
    fn test_repeated_admin_flags() {
        let config = Config::try_parse_from([
            "study-client",
            "--admin",
            "a@uni.edu",
            "--admin",
            "b@uni.edu,c@uni.edu",
        ])
        .unwrap();
        assert_eq!(config.admins, vec!["a@uni.edu", "b@uni.edu", "c@uni.edu"]);
    }

    #[test]
    fn test_custom_state_dir() {
        let config = Config::try_parse_from(["study-client", "--state-dir", "/tmp/study"]).unwrap();
        assert_eq!(config.state_dir().unwrap(), PathBuf::from("/tmp/study"));
        assert_eq!(config.state_db().unwrap(), PathBuf::from("/tmp/study/session.db"));
    }

    #[test]
    fn test_backend_requires_anon_key() {
        let config = Config::try_parse_from(["study-client"]).unwrap();
        assert!(matches!(config.backend(), Err(ClientError::Config(_))));

        let config = Config::try_parse_from([
            "study-client",
            "--url",
            "https://project.example.co",
            "--anon-key",
            "public",
            "--service-key",
            "secret",
        ])
        .unwrap();
        let backend = config.backend().unwrap();
        assert_eq!(backend.service_key.as_deref(), Some("secret"));
    }
}
