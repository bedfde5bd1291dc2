//! authrelay - an authenticated API client that refreshes expired access
//! credentials exactly once, however many requests notice the expiry.
//!
//! The pieces, leaf to root:
//!
//! - [`auth::CredentialStore`]: access credential in memory, refresh
//!   credential in a durable [`auth::RefreshSlot`]
//! - [`refresh::RefreshExchange`]: one round trip to the refresh endpoint
//! - [`refresh::Coordinator`]: single-flight refresh with a FIFO queue of
//!   suspended callers and session-ended notifications
//! - [`api::ApiClient`]: attaches the credential, refreshes on 401, replays
//!   once
//!
//! [`auth::SessionManager`] adds registration, login, logout, profile and
//! startup restore, and
//! [`config::Config`] wires everything from a config file.

pub mod api;
pub mod auth;
pub mod config;
pub mod refresh;

pub use api::{ApiClient, ApiError, ApiRequest};
pub use auth::{
    AccessCredential, CredentialStore, Profile, RefreshCredential, Registration, SessionManager,
};
pub use config::{Config, StorageBackend};
pub use refresh::{Coordinator, RefreshError, RefreshState, SessionEnded, SessionObserver};
