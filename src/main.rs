mod app;
mod config;
mod models;
mod providers;
mod services;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use app::App;
use config::AppConfig;
use providers::{HostedAuthProvider, OpenAiProvider};
use services::keyring::COMPLETION_API_KEY;
use services::{
    AuthGuard, Database, GuardPolicy, KeyringService, SessionTracker, SettingsService, SystemClock,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = AppConfig::from_env()?;
    tracing::debug!(?config, "Configuration loaded");

    let db = Database::open(&config.db_path)?;

    let keyring = match KeyringService::new().await {
        Ok(keyring) => Some(keyring),
        Err(e) => {
            tracing::warn!("Keyring unavailable, secrets will not be stored: {:#}", e);
            None
        }
    };

    if config.completion.api_key.is_empty() {
        if let Some(keyring) = &keyring {
            match keyring.retrieve(COMPLETION_API_KEY).await {
                Ok(Some(key)) => config.completion.api_key = key,
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to read API key from keyring: {:#}", e),
            }
        }
    }
    if config.completion.api_key.is_empty() {
        tracing::warn!("No completion API key configured; replies will fall back");
    }

    let settings = SettingsService::load(&db).await;
    settings.apply_to(&mut config.completion);

    let completion = Arc::new(
        OpenAiProvider::new(config.completion.clone())
            .context("Failed to set up completion client")?,
    );
    let auth = Arc::new(HostedAuthProvider::new(config.auth.clone()));

    let policy = GuardPolicy {
        captcha: settings.captcha_policy,
        ..GuardPolicy::default()
    };
    let guard = AuthGuard::new(auth.clone(), Arc::new(SystemClock), policy)
        .with_attempt_log(Arc::new(db.clone()));
    let tracker = SessionTracker::start(auth.clone()).await;

    tracing::info!("Starting {}", config::APP_NAME);
    App::new(db, keyring, auth, completion, guard, tracker).run().await
}
