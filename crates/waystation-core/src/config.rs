//! Configuration management.
//!
//! `Config` is the serialized form, stored as JSON at
//! `~/.config/waystation/config.json`. Missing files and missing fields
//! fall back to defaults. `Settings` is the validated runtime view handed
//! to the host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::maintenance::MaintenancePolicy;
use crate::store::VersionTag;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "waystation";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Dynamic partition entry cap
const DEFAULT_MAX_DYNAMIC_ENTRIES: usize = 100;

/// Dynamic entries with a timestamp older than this are evicted
const DEFAULT_MAX_ENTRY_AGE_DAYS: i64 = 30;

const DEFAULT_TIMESTAMP_PARAM: &str = "timestamp";

/// Periodic maintenance runs once a day
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 24 * 60 * 60;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Origin the intermediary serves, e.g. `https://app.example/`
    pub origin: String,
    pub version: String,
    /// Paths preloaded into the static partition at install time
    pub manifest: Vec<String>,
    /// Document served when an HTML request fails offline
    pub offline_fallback: String,
    pub vary_headers: Vec<String>,
    /// Activate a new install immediately instead of waiting for clients
    pub skip_waiting: bool,
    pub max_dynamic_entries: usize,
    pub max_entry_age_days: i64,
    pub timestamp_param: String,
    pub maintenance_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8080/".to_string(),
            version: "v1".to_string(),
            manifest: vec!["/".to_string(), "/index.html".to_string()],
            offline_fallback: "/index.html".to_string(),
            vary_headers: Vec::new(),
            skip_waiting: true,
            max_dynamic_entries: DEFAULT_MAX_DYNAMIC_ENTRIES,
            max_entry_age_days: DEFAULT_MAX_ENTRY_AGE_DAYS,
            timestamp_param: DEFAULT_TIMESTAMP_PARAM.to_string(),
            maintenance_interval_secs: DEFAULT_MAINTENANCE_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            cache_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
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

    /// Apply `WAYSTATION_ORIGIN` / `WAYSTATION_VERSION` from the environment
    pub fn apply_env(&mut self) {
        if let Ok(origin) = std::env::var("WAYSTATION_ORIGIN") {
            self.origin = origin;
        }
        if let Ok(version) = std::env::var("WAYSTATION_VERSION") {
            self.version = version;
        }
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn settings(&self) -> Result<Settings> {
        let scope = Url::parse(&self.origin)
            .with_context(|| format!("Invalid origin URL: {}", self.origin))?;
        if scope.cannot_be_a_base() {
            anyhow::bail!("Origin URL cannot be used as a base: {}", self.origin);
        }
        if self.version.trim().is_empty() {
            anyhow::bail!("Version tag must not be empty");
        }
        if self.maintenance_interval_secs == 0 {
            anyhow::bail!("maintenance_interval_secs must be greater than zero");
        }
        let max_age = chrono::Duration::try_days(self.max_entry_age_days).ok_or_else(|| {
            anyhow::anyhow!("max_entry_age_days out of range: {}", self.max_entry_age_days)
        })?;

        Ok(Settings {
            scope,
            version: VersionTag::new(self.version.trim()),
            manifest: self.manifest.clone(),
            offline_fallback: self.offline_fallback.clone(),
            vary_headers: self.vary_headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
            skip_waiting: self.skip_waiting,
            maintenance: MaintenancePolicy {
                max_entries: self.max_dynamic_entries,
                max_age,
                timestamp_param: self.timestamp_param.clone(),
            },
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        })
    }
}

/// Validated runtime settings shared by every intermediary instance.
#[derive(Debug, Clone)]
pub struct Settings {
    pub scope: Url,
    pub version: VersionTag,
    pub manifest: Vec<String>,
    pub offline_fallback: String,
    pub vary_headers: Vec<String>,
    pub skip_waiting: bool,
    pub maintenance: MaintenancePolicy,
    pub maintenance_interval: Duration,
    pub request_timeout: Duration,
}

impl Settings {
    /// Defaults for the given origin and version
    pub fn new(scope: Url, version: VersionTag) -> Self {
        let defaults = Config::default();
        Self {
            scope,
            version,
            manifest: defaults.manifest,
            offline_fallback: defaults.offline_fallback,
            vary_headers: defaults.vary_headers,
            skip_waiting: defaults.skip_waiting,
            maintenance: MaintenancePolicy::default(),
            maintenance_interval: Duration::from_secs(defaults.maintenance_interval_secs),
            request_timeout: Duration::from_secs(defaults.request_timeout_secs),
        }
    }

    pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
        self.skip_waiting = skip_waiting;
        self
    }

    pub fn with_manifest(mut self, manifest: Vec<String>) -> Self {
        self.manifest = manifest;
        self
    }
}
