use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::slot::{RefreshSlot, StoreError};

/// Short-lived bearer token attached to every outgoing request.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredential(String);

impl AccessCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessCredential(***)")
    }
}

/// Long-lived token traded for a new access credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshCredential(String);

impl RefreshCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RefreshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshCredential(***)")
    }
}

/// Holds the access credential in memory and the refresh credential in a
/// durable slot.
///
/// Outside of tests the store is only written by the
/// [`Coordinator`](crate::refresh::Coordinator), which serializes refresh
/// cycles with login and logout.
pub struct CredentialStore {
    access: RwLock<Option<AccessCredential>>,
    slot: Box<dyn RefreshSlot>,
}

impl CredentialStore {
    pub fn new(slot: Box<dyn RefreshSlot>) -> Self {
        Self {
            access: RwLock::new(None),
            slot,
        }
    }

    pub fn get_access(&self) -> Option<AccessCredential> {
        self.access.read().clone()
    }

    pub fn set_access(&self, access: Option<AccessCredential>) {
        *self.access.write() = access;
    }

    pub fn get_refresh(&self) -> Result<Option<RefreshCredential>, StoreError> {
        self.slot.load()
    }

    /// Persist the refresh credential, or delete it when `None`
    pub fn set_refresh(&self, refresh: Option<RefreshCredential>) -> Result<(), StoreError> {
        match refresh {
            Some(ref token) => self.slot.save(token),
            None => self.slot.delete(),
        }
    }

    /// Forget both credentials. The in-memory access credential is dropped
    /// even when the durable slot cannot be cleared.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.set_access(None);
        debug!("Access credential cleared");
        self.slot.delete()
    }
}
