/// Study companion client - main entry point
///
/// A terminal client for friends, study presence and the group chat, backed
/// by a hosted backend or, with `--offline`, by an in-process one.
use anyhow::Context;
use log::info;
use std::sync::Arc;
use study_companion::cli;
use study_companion::client::StudyClient;
use study_companion::config::Config;
use study_companion::remote::{
    AuthService, DataService, MemoryAuth, MemoryBackend, RestAuth, RestClient, TokenSlot,
};
use study_companion::storage::SessionStore;

async fn run<A: AuthService, D: DataService>(client: StudyClient<A, D>) -> anyhow::Result<()> {
    if let Some(identity) = client.initialize().await {
        info!("Resumed session for {}", identity.email);
    }

    let result = cli::run_client_loop(&client).await;
    client.shutdown();
    result.context("client loop failed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    // Initialize logger with appropriate level based on verbose flag
    let log_level = if config.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    info!("Starting study companion client");

    if config.offline {
        info!("Offline mode: using an in-process backend");
        let backend = MemoryBackend::new();
        let auth = Arc::new(MemoryAuth::new(backend.clone()));
        return run(StudyClient::new(auth, Arc::new(backend), config.admins)).await;
    }

    let backend = config.backend().context("invalid backend configuration")?;
    info!("Backend: {}", backend.url);

    let state_dir = config.state_dir()?;
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("cannot create state directory {}", state_dir.display()))?;
    info!("State directory: {}", state_dir.display());
    let store = SessionStore::new(config.state_db()?).context("cannot open session store")?;

    let tokens = TokenSlot::default();
    let data = Arc::new(RestClient::new(backend.clone(), tokens.clone())?);
    let auth = Arc::new(RestAuth::new(backend, tokens, Some(store))?);

    let refresher = auth.spawn_auto_refresh();
    let watchdog = data.realtime().spawn_watchdog();

    let result = run(StudyClient::new(auth, Arc::clone(&data), config.admins)).await;

    refresher.abort();
    watchdog.abort();
    data.realtime().stop().await;
    result
}
