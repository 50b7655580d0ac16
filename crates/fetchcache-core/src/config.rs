//! Client configuration management.
//!
//! This module handles loading and saving the access client configuration:
//! the backend base URL, default headers, cache lifetimes, retry and
//! backoff settings.
//!
//! Configuration is stored at `~/.config/fetchcache/config.json` unless a
//! path is given explicitly. Every field has a default, so a partial file
//! (or no file at all) is valid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::retry::{RetryOn, RetryPolicy, DEFAULT_BACKOFF_UNIT_MS, DEFAULT_MAX_BACKOFF_MS};
use crate::api::transport::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::cache::DEFAULT_TTL;

/// Application name used for the config directory path
const APP_NAME: &str = "fetchcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default base URL for relative endpoints
const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// How often expired cache entries are swept, in seconds.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Retries per request when the caller does not say otherwise.
const DEFAULT_RETRIES: u32 = 3;

const ENV_BASE_URL: &str = "FETCHCACHE_BASE_URL";
const ENV_RETRIES: &str = "FETCHCACHE_RETRIES";
const ENV_CACHE_TTL_SECS: &str = "FETCHCACHE_CACHE_TTL_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    /// Sent with every request. `Content-Type: application/json` is added
    /// separately, and only to requests that carry a body.
    pub default_headers: BTreeMap<String, String>,
    pub default_cache_ttl_secs: u64,
    /// Zero disables the background sweep.
    pub sweep_interval_secs: u64,
    pub default_retries: u32,
    pub backoff_unit_ms: u64,
    pub max_backoff_ms: u64,
    pub retry_on: RetryOn,
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_headers: BTreeMap::new(),
            default_cache_ttl_secs: DEFAULT_TTL.as_secs(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            default_retries: DEFAULT_RETRIES,
            backoff_unit_ms: DEFAULT_BACKOFF_UNIT_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            retry_on: RetryOn::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Load from the default location, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Overlay settings from `FETCHCACHE_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(base_url) = var(ENV_BASE_URL) {
            self.base_url = base_url;
        }
        if let Some(retries) = var(ENV_RETRIES) {
            self.default_retries = retries
                .trim()
                .parse()
                .with_context(|| format!("{} must be a non-negative integer", ENV_RETRIES))?;
        }
        if let Some(ttl) = var(ENV_CACHE_TTL_SECS) {
            self.default_cache_ttl_secs = ttl
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds", ENV_CACHE_TTL_SECS))?;
        }
        Ok(())
    }

    pub fn default_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.default_cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_on: self.retry_on,
            backoff_unit: Duration::from_millis(self.backoff_unit_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}
