//! Durable storage for the refresh credential.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use keyring::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::RefreshCredential;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt credential file: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single key-value slot that survives process restarts.
pub trait RefreshSlot: Send + Sync {
    fn load(&self) -> Result<Option<RefreshCredential>, StoreError>;

    fn save(&self, refresh: &RefreshCredential) -> Result<(), StoreError>;

    /// Deleting an empty slot is not an error
    fn delete(&self) -> Result<(), StoreError>;
}

/// Refresh credential kept in the OS keychain
pub struct KeyringSlot {
    service: String,
    account: String,
}

impl KeyringSlot {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, &self.account)?)
    }
}

impl RefreshSlot for KeyringSlot {
    fn load(&self) -> Result<Option<RefreshCredential>, StoreError> {
        match self.entry()?.get_password() {
            Ok(token) => Ok(Some(RefreshCredential::new(token))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, refresh: &RefreshCredential) -> Result<(), StoreError> {
        self.entry()?.set_password(refresh.as_str())?;
        debug!(service = %self.service, "Refresh credential stored in keychain");
        Ok(())
    }

    fn delete(&self) -> Result<(), StoreError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRefresh {
    refresh: RefreshCredential,
    stored_at: DateTime<Utc>,
}

/// Refresh credential kept in a JSON file, for hosts without a keychain
pub struct FileSlot {
    path: PathBuf,
    io: Mutex<()>,
}

impl FileSlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the stored credential was written, if there is one
    pub fn stored_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let _io = self.io.lock();
        Ok(self.read()?.map(|stored| stored.stored_at))
    }

    fn read(&self) -> Result<Option<StoredRefresh>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

impl RefreshSlot for FileSlot {
    fn load(&self) -> Result<Option<RefreshCredential>, StoreError> {
        let _io = self.io.lock();
        Ok(self.read()?.map(|stored| stored.refresh))
    }

    fn save(&self, refresh: &RefreshCredential) -> Result<(), StoreError> {
        let _io = self.io.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredRefresh {
            refresh: refresh.clone(),
            stored_at: Utc::now(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&stored)?)?;
        debug!(path = %self.path.display(), "Refresh credential written");
        Ok(())
    }

    fn delete(&self) -> Result<(), StoreError> {
        let _io = self.io.lock();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Process-local slot; nothing survives a restart
#[derive(Default)]
pub struct MemorySlot {
    value: Mutex<Option<RefreshCredential>>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh(refresh: RefreshCredential) -> Self {
        Self {
            value: Mutex::new(Some(refresh)),
        }
    }
}

impl RefreshSlot for MemorySlot {
    fn load(&self) -> Result<Option<RefreshCredential>, StoreError> {
        Ok(self.value.lock().clone())
    }

    fn save(&self, refresh: &RefreshCredential) -> Result<(), StoreError> {
        *self.value.lock() = Some(refresh.clone());
        Ok(())
    }

    fn delete(&self) -> Result<(), StoreError> {
        *self.value.lock() = None;
        Ok(())
    }
}
