//! Service configuration.
//!
//! Read from `<config_dir>/flowkey/config.json` when present; every field
//! has a default, and a couple of environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::orchestrator::TesterConfig;
use crate::persister::PersisterConfig;

const CONFIG_FILE: &str = "config.json";
const ENV_BASE_URL: &str = "FLOWKEY_BASE_URL";
const ENV_QUIET_PERIOD_MS: &str = "FLOWKEY_QUIET_PERIOD_MS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL of the credential backend.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Quiet period before an edited field is saved.
    pub quiet_period_ms: u64,
    /// How long a "saved" status stays visible.
    pub saved_display_ms: u64,
    /// How long a key test verdict stays visible.
    pub test_display_ms: u64,
    /// Generation services probed by the token health test.
    pub probe_services: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8787/api".to_string(),
            request_timeout_secs: 30,
            quiet_period_ms: 2000,
            saved_display_ms: 3000,
            test_display_ms: 5000,
            probe_services: vec!["Imagen".to_string(), "Veo".to_string()],
        }
    }
}

impl ServiceConfig {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&default_config_path())?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("invalid config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Apply overrides looked up through `var`.
    pub fn apply_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = var(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = base_url.trim().to_string();
        }
        if let Some(ms) = var(ENV_QUIET_PERIOD_MS) {
            self.quiet_period_ms = ms
                .trim()
                .parse()
                .with_context(|| format!("{ENV_QUIET_PERIOD_MS} must be milliseconds, got '{ms}'"))?;
        }
        url::Url::parse(&self.base_url)
            .with_context(|| format!("invalid base_url '{}'", self.base_url))?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn persister(&self) -> PersisterConfig {
        PersisterConfig {
            quiet_period: Duration::from_millis(self.quiet_period_ms),
            saved_display: Duration::from_millis(self.saved_display_ms),
        }
    }

    pub fn tester(&self) -> TesterConfig {
        TesterConfig {
            result_display: Duration::from_millis(self.test_display_ms),
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flowkey")
        .join(CONFIG_FILE)
}
