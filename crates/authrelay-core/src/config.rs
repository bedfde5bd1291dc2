//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the API
//! base URL, where the refresh credential is kept, and the last email used
//! to log in.
//!
//! Configuration is stored at `~/.config/authrelay/config.json`. The
//! `AUTHRELAY_API_BASE` and `AUTHRELAY_STORAGE` environment variables
//! override the file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::api::client::REQUEST_TIMEOUT_SECS;
use crate::auth::{FileSlot, KeyringSlot, RefreshSlot};

/// Application name used for config/cache directory paths and the keychain
const APP_NAME: &str = "authrelay";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Refresh credential file name when using file storage
const REFRESH_FILE: &str = "refresh.json";

pub const DEFAULT_API_BASE: &str = "http://localhost:8000";

const ENV_API_BASE: &str = "AUTHRELAY_API_BASE";
const ENV_STORAGE: &str = "AUTHRELAY_STORAGE";

/// Where the refresh credential is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Keyring,
    File,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(StorageBackend::Keyring),
            "file" => Ok(StorageBackend::File),
            other => Err(anyhow::anyhow!(
                "Unknown storage backend '{}' (expected 'keyring' or 'file')",
                other
            )),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Keyring => f.write_str("keyring"),
            StorageBackend::File => f.write_str("file"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_base: Option<String>,
    #[serde(default)]
    pub storage: StorageBackend,
    pub last_email: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

impl Config {
    /// Load from the default location and apply environment overrides
    pub fn load() -> Result<Self> {
        let config = Self::load_from(&Self::config_path()?)?;
        config.with_overrides(
            std::env::var(ENV_API_BASE).ok(),
            std::env::var(ENV_STORAGE).ok(),
        )
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
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

    /// Apply override values (normally taken from the environment)
    pub fn with_overrides(mut self, api_base: Option<String>, storage: Option<String>) -> Result<Self> {
        if let Some(api_base) = api_base.filter(|value| !value.trim().is_empty()) {
            self.api_base = Some(api_base);
        }
        if let Some(storage) = storage {
            self.storage = storage.parse()?;
        }
        Ok(self)
    }

    pub fn api_base(&self) -> &str {
        self.api_base.as_deref().unwrap_or(DEFAULT_API_BASE)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(REQUEST_TIMEOUT_SECS))
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Build the configured durable slot. Keychain entries are keyed by API
    /// base so sessions against different servers do not collide.
    pub fn refresh_slot(&self) -> Result<Box<dyn RefreshSlot>> {
        Ok(match self.storage {
            StorageBackend::Keyring => Box::new(KeyringSlot::new(APP_NAME, self.api_base())),
            StorageBackend::File => Box::new(FileSlot::new(self.cache_dir()?.join(REFRESH_FILE))),
        })
    }
}
