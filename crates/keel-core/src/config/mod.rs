//! Sync engine configuration.
//!
//! `SyncSettings` is read from `keel/sync-config.json` under the platform
//! config directory, then overridden by `KEEL_*` environment variables.
//! Credentials are never stored here; the API token comes from the
//! environment only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::TieBreakPolicy;
use crate::util::{is_http_url, normalize_text_option};

const CONFIG_DIR_NAME: &str = "keel";
const CONFIG_FILE_NAME: &str = "sync-config.json";
const DATABASE_FILE_NAME: &str = "keel.db";

/// Environment variable holding the bearer token for the sync API
pub const API_TOKEN_ENV: &str = "KEEL_API_TOKEN";

/// Runtime settings of the sync engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SyncSettings {
    /// Stable identifier of this device, stamped as `originSource`
    pub device_id: String,
    /// Remote (internet) base URL of the sync API
    pub remote_base_url: Option<String>,
    /// Optional on-boat base URL, tried before the remote one
    pub local_base_url: Option<String>,
    pub local_timeout_ms: u64,
    pub remote_timeout_ms: u64,
    /// Periodic sync interval; 0 disables periodic sync
    pub sync_interval_secs: u64,
    /// Ceiling of the retry backoff for transient failures
    pub max_backoff_secs: u64,
    /// How long `Synced` change records are kept before garbage collection
    pub synced_retention_secs: u64,
    pub tie_break: TieBreakPolicy,
    /// Maximum number of records pushed concurrently per handler
    pub push_concurrency: usize,
    /// Path of the server-sent events stream, relative to the base URL
    pub realtime_path: String,
    /// Ceiling of the realtime reconnect backoff
    pub realtime_max_reconnect_secs: u64,
    pub db_path: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::now_v7().to_string(),
            remote_base_url: None,
            local_base_url: None,
            local_timeout_ms: 1_500,
            remote_timeout_ms: 15_000,
            sync_interval_secs: 300,
            max_backoff_secs: 3_600,
            synced_retention_secs: 7 * 24 * 60 * 60,
            tie_break: TieBreakPolicy::default(),
            push_concurrency: 4,
            realtime_path: "/events".to_string(),
            realtime_max_reconnect_secs: 60,
            db_path: None,
        }
    }
}

/// Default settings file location
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or_else(|| Error::Config("failed to resolve config directory".to_string()))
}

/// Default database location
pub fn default_database_path() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(DATABASE_FILE_NAME))
        .ok_or_else(|| Error::Config("failed to resolve data directory".to_string()))
}

impl SyncSettings {
    /// Load from the default path and the process environment.
    ///
    /// A settings file is written on first use so the device id stays stable.
    pub fn load() -> Result<Self> {
        Self::load_or_init(&default_config_path()?)
    }

    /// `load` against an explicit settings file.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        let existed = path.exists();
        let mut settings = Self::load_from_path(path)?;
        if !existed {
            settings.save_to_path(path)?;
            tracing::info!("Created sync settings at {}", path.display());
        }
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from a JSON file, falling back to defaults if absent
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let mut settings = serde_json::from_str::<Self>(&raw).map_err(|error| {
            Error::Config(format!("failed to parse {}: {error}", path.display()))
        })?;
        settings.normalize();
        Ok(settings)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut normalized = self.clone();
        normalized.normalize();
        std::fs::write(path, serde_json::to_string_pretty(&normalized)?)?;
        Ok(())
    }

    /// Apply `KEEL_*` overrides from the given lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |key: &str| normalize_text_option(lookup(key));
        let number = |key: &str| {
            let value = text(key)?;
            match value.parse::<u64>() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    tracing::warn!("Ignoring {key}={value}: not a number");
                    None
                }
            }
        };

        if let Some(device_id) = text("KEEL_DEVICE_ID") {
            self.device_id = device_id;
        }
        if let Some(url) = text("KEEL_REMOTE_URL") {
            self.remote_base_url = Some(url);
        }
        if let Some(url) = text("KEEL_LOCAL_URL") {
            self.local_base_url = Some(url);
        }
        if let Some(path) = text("KEEL_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = number("KEEL_SYNC_INTERVAL_SECS") {
            self.sync_interval_secs = secs;
        }
        if let Some(secs) = number("KEEL_MAX_BACKOFF_SECS") {
            self.max_backoff_secs = secs;
        }
        if let Some(policy) = text("KEEL_TIE_BREAK") {
            match policy.parse() {
                Ok(policy) => self.tie_break = policy,
                Err(error) => tracing::warn!("Ignoring KEEL_TIE_BREAK: {error}"),
            }
        }
        self.normalize();
    }

    /// Check URLs and numeric bounds
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::Config("device_id must not be empty".to_string()));
        }
        for (field, url) in [
            ("remote_base_url", &self.remote_base_url),
            ("local_base_url", &self.local_base_url),
        ] {
            if let Some(url) = url {
                if !is_http_url(url) {
                    return Err(Error::Config(format!(
                        "{field} must include http:// or https://"
                    )));
                }
            }
        }
        if self.push_concurrency == 0 {
            return Err(Error::Config(
                "push_concurrency must be at least 1".to_string(),
            ));
        }
        if !self.realtime_path.starts_with('/') {
            return Err(Error::Config(
                "realtime_path must start with '/'".to_string(),
            ));
        }
        Ok(())
    }

    /// Database path, defaulting to the platform data directory
    pub fn database_path(&self) -> Result<PathBuf> {
        self.db_path
            .clone()
            .map_or_else(default_database_path, Ok)
    }

    pub const fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub const fn synced_retention(&self) -> Duration {
        Duration::from_secs(self.synced_retention_secs)
    }

    pub const fn local_timeout(&self) -> Duration {
        Duration::from_millis(self.local_timeout_ms)
    }

    pub const fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub const fn realtime_max_reconnect(&self) -> Duration {
        Duration::from_secs(self.realtime_max_reconnect_secs)
    }

    /// Periodic interval, or `None` when disabled
    pub const fn sync_interval(&self) -> Option<Duration> {
        if self.sync_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sync_interval_secs))
        }
    }

    fn normalize(&mut self) {
        self.device_id = self.device_id.trim().to_string();
        self.remote_base_url = normalize_url(self.remote_base_url.take());
        self.local_base_url = normalize_url(self.local_base_url.take());
        self.realtime_path = self.realtime_path.trim().to_string();
    }
}

fn normalize_url(value: Option<String>) -> Option<String> {
    normalize_text_option(value).map(|url| url.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_bounded() {
        let settings = SyncSettings::default();
        assert_eq!(settings.max_backoff(), Duration::from_secs(3_600));
        assert_eq!(settings.synced_retention(), Duration::from_secs(604_800));
        assert_eq!(settings.tie_break, TieBreakPolicy::PreferLocal);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn save_and_load_keeps_device_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let settings = SyncSettings {
            remote_base_url: Some("https://sync.example.com/".to_string()),
            ..SyncSettings::default()
        };

        settings.save_to_path(&path).unwrap();
        let loaded = SyncSettings::load_from_path(&path).unwrap();
        assert_eq!(loaded.device_id, settings.device_id);
        assert_eq!(
            loaded.remote_base_url.as_deref(),
            Some("https://sync.example.com")
        );
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{ "device_id": "boat-tablet", "tie_break": "conflict" }"#)
            .unwrap();

        let loaded = SyncSettings::load_from_path(&path).unwrap();
        assert_eq!(loaded.device_id, "boat-tablet");
        assert_eq!(loaded.tie_break, TieBreakPolicy::Conflict);
        assert_eq!(loaded.push_concurrency, 4);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{ "server_token": "abc" }"#).unwrap();

        let error = SyncSettings::load_from_path(&path).unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("KEEL_REMOTE_URL", " https://api.example.com/ "),
            ("KEEL_MAX_BACKOFF_SECS", "120"),
            ("KEEL_SYNC_INTERVAL_SECS", "soon"),
            ("KEEL_TIE_BREAK", "prefer_remote"),
        ]);
        let mut settings = SyncSettings::default();
        settings.apply_overrides(|key| env.get(key).map(ToString::to_string));

        assert_eq!(
            settings.remote_base_url.as_deref(),
            Some("https://api.example.com")
        );
        assert_eq!(settings.max_backoff_secs, 120);
        assert_eq!(settings.sync_interval_secs, 300);
        assert_eq!(settings.tie_break, TieBreakPolicy::PreferRemote);
    }

    #[test]
    fn validate_rejects_bad_urls_and_concurrency() {
        let settings = SyncSettings {
            local_base_url: Some("boat.local:8080".to_string()),
            ..SyncSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = SyncSettings {
            push_concurrency: 0,
            ..SyncSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_interval_disables_periodic_sync() {
        let settings = SyncSettings {
            sync_interval_secs: 0,
            ..SyncSettings::default()
        };
        assert_eq!(settings.sync_interval(), None);
    }
}
