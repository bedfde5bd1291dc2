//! Authentication module for credentials and user sessions.
//!
//! This module provides:
//! - `CredentialStore`: access credential in memory, refresh credential in a
//!   durable `RefreshSlot` (OS keychain, JSON file, or memory)
//! - `SessionManager`: registration, login, logout, profile and startup
//!   restore

pub mod credentials;
pub mod session;
pub mod slot;

pub use credentials::{AccessCredential, CredentialStore, RefreshCredential};
pub use session::{Profile, Registration, SessionManager};
pub use slot::{FileSlot, KeyringSlot, MemorySlot, RefreshSlot, StoreError};
