//! FlowKey Service - credential status for one user
//!
//! Loads the user's record from the credential backend, resolves the
//! effective captcha key, runs the token health probes and prints the
//! outcome as JSON.
//!
//! Usage: `flowkey-service <user-id>` (or set `FLOWKEY_USER_ID`).

use std::sync::Arc;

use anyhow::{Context, Result};
use flowkey_service::middleware::{EncryptedStore, KeyValueStore, MemoryStore, SessionState};
use flowkey_service::remote::{HttpRemoteStore, RemoteCredentialStore, ServiceConfig};
use flowkey_service::{AccountSession, ResolvedCredential};

const ENV_USER_ID: &str = "FLOWKEY_USER_ID";

/// Initialize structured logging with tracing
fn init_logging() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    #[cfg(target_os = "linux")]
    {
        // Try systemd journal first, fall back to tracing
        let journal = systemd_journal_logger::JournalLog::new()
            .map_err(anyhow::Error::from)
            .and_then(|journal| journal.install().map_err(anyhow::Error::from));
        if journal.is_ok() {
            log::set_max_level(log::LevelFilter::Info);
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Long-lived preferences; in memory when the encrypted store is unusable.
fn persistent_store() -> Arc<dyn KeyValueStore> {
    match EncryptedStore::open_default() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "Encrypted store unavailable, preferences kept in memory");
            Arc::new(MemoryStore::new())
        }
    }
}

fn mask(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    if value.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{visible}****")
    }
}

fn credential_json(resolved: Option<&ResolvedCredential>) -> serde_json::Value {
    match resolved {
        Some(resolved) if !resolved.is_none() => serde_json::json!({
            "source": resolved.source(),
            "value": mask(resolved.value()),
        }),
        _ => serde_json::json!({ "source": "NONE", "value": null }),
    }
}

async fn run(user_id: &str) -> Result<serde_json::Value> {
    let config = ServiceConfig::load().context("failed to load configuration")?;
    tracing::info!(base_url = %config.base_url, "FlowKey Service starting");

    let remote = Arc::new(HttpRemoteStore::from_config(&config)?);
    let record = remote
        .fetch_record(user_id)
        .await
        .with_context(|| format!("failed to fetch record of {user_id}"))?;

    let account = AccountSession::with_persistent_store(
        remote,
        SessionState::in_memory(),
        persistent_store(),
        &config,
    );
    account.observe_user(Some(record)).await;

    let probes = match account.test_token().await {
        Ok(Some(results)) => serde_json::to_value(results)?,
        Ok(None) => serde_json::Value::Null,
        Err(e) if e.is_silent() => serde_json::Value::Null,
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };
    let upgrade = account.upgrade_details();

    Ok(serde_json::json!({
        "userId": user_id,
        "captchaKey": credential_json(account.resolved().as_ref()),
        "server": account.server_display(),
        "sharedApiKeyLoaded": account.shared_api_key_loaded(),
        "preferredProjectId": account.preferred_project_id(),
        "upgrade": {
            "registration": upgrade.registration,
            "pooledEmail": upgrade.pooled_email.map(|p| p.email),
        },
        "tokenProbes": probes,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let user_id = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(ENV_USER_ID).ok())
        .filter(|id| !id.trim().is_empty())
        .with_context(|| format!("usage: flowkey-service <user-id> (or set {ENV_USER_ID})"))?;

    let report = tokio::select! {
        report = run(user_id.trim()) => report?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            return Ok(());
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
