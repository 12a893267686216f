//! Runtime settings for the ANAF integration
//!
//! Loaded using the following priority:
//! 1. JSON file (~/.config/efactura/efactura.json), missing fields defaulted
//! 2. Built-in defaults when no file exists
//!
//! Environment variables are applied on top of either.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ratelimit::BackoffSettings;

/// Settings filename in the efactura config directory
const SETTINGS_FILE: &str = "efactura.json";

pub const DEFAULT_OAUTH_BASE_URL: &str = "https://logincert.anaf.ro/anaf-oauth2/v1";
pub const DEFAULT_API_BASE_URL: &str = "https://api.anaf.ro/prod/FCTEL/rest";

/// Endpoints, timeouts and limits used by the token manager and sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnafSettings {
    pub authorize_url: String,
    pub token_url: String,
    /// Remote revocation is skipped when unset
    pub revoke_url: Option<String>,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    /// A token is refreshed once `now >= expires_at - margin`
    pub token_safety_margin_secs: u64,
    pub authorization_state_ttl_secs: u64,
    /// Largest `zile` window requested from the list endpoint
    pub retention_days: u32,
    /// Pending documents re-fetched at the end of each run
    pub document_retries_per_run: usize,
    /// How long a sync run may wait for a list permit
    pub list_wait_secs: u64,
    /// Seconds between periodic driver cycles
    pub scheduler_tick_secs: u64,
    pub backoff: BackoffSettings,
}

impl Default for AnafSettings {
    fn default() -> Self {
        Self::with_oauth_base(DEFAULT_OAUTH_BASE_URL, DEFAULT_API_BASE_URL)
    }
}

impl AnafSettings {
    /// Defaults with all OAuth endpoints under `oauth_base`
    pub fn with_oauth_base(oauth_base: &str, api_base: &str) -> Self {
        let oauth_base = oauth_base.trim_end_matches('/');
        Self {
            authorize_url: format!("{oauth_base}/authorize"),
            token_url: format!("{oauth_base}/token"),
            revoke_url: Some(format!("{oauth_base}/revoke")),
            api_base_url: api_base.trim_end_matches('/').to_string(),
            request_timeout_secs: 30,
            token_safety_margin_secs: 300,
            authorization_state_ttl_secs: 600,
            retention_days: 60,
            document_retries_per_run: 10,
            list_wait_secs: 30,
            scheduler_tick_secs: 900,
            backoff: BackoffSettings::default(),
        }
    }

    /// Load settings from the config directory, then apply env overrides
    pub fn load() -> Result<Self> {
        let settings = if config::config_exists(SETTINGS_FILE) {
            config::load_json(SETTINGS_FILE)?
        } else {
            Self::default()
        };
        settings.with_env_overrides()
    }

    /// Load settings from a specific JSON file, then apply env overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings: Self = config::load_json_file(path)?;
        settings.with_env_overrides()
    }

    /// Parse settings from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse settings JSON")
    }

    /// Apply `ANAF_*` environment variables
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(base) = config::env_var("ANAF_OAUTH_BASE_URL") {
            let base = base.trim_end_matches('/');
            self.authorize_url = format!("{base}/authorize");
            self.token_url = format!("{base}/token");
            self.revoke_url = Some(format!("{base}/revoke"));
        }
        if let Some(base) = config::env_var("ANAF_API_BASE_URL") {
            self.api_base_url = base.trim_end_matches('/').to_string();
        }
        if let Some(days) = config::env_parse::<u32>("ANAF_RETENTION_DAYS")? {
            self.retention_days = days;
        }
        if let Some(secs) = config::env_parse::<u64>("ANAF_REQUEST_TIMEOUT_SECS")? {
            self.request_timeout_secs = secs;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.retention_days >= 1, "retention_days must be at least 1");
        anyhow::ensure!(
            self.request_timeout_secs >= 1,
            "request_timeout_secs must be at least 1"
        );
        for url in [&self.authorize_url, &self.token_url, &self.api_base_url] {
            url::Url::parse(url).with_context(|| format!("Invalid endpoint URL: {url}"))?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_safety_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_safety_margin_secs as i64)
    }

    pub fn authorization_state_ttl(&self) -> Duration {
        Duration::from_secs(self.authorization_state_ttl_secs)
    }

    pub fn list_wait(&self) -> Duration {
        Duration::from_secs(self.list_wait_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    /// Get the default settings file path (~/.config/efactura/efactura.json)
    pub fn default_settings_path() -> Option<PathBuf> {
        config::config_path(SETTINGS_FILE)
    }
}
