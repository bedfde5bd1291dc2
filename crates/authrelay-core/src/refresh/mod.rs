//! Credential refresh: the network exchange, the single-flight coordinator
//! and session boundary notifications.
//!
//! - `RefreshExchange` / `HttpRefreshExecutor`: one round trip to the
//!   refresh endpoint
//! - `Coordinator`: at most one refresh in flight, FIFO queue of waiters
//! - `SessionEvents`: observers told when the session can no longer be
//!   refreshed

pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;

pub use coordinator::{Coordinator, RefreshState};
pub use error::RefreshError;
pub use events::{SessionEnded, SessionEvents, SessionObserver, SubscriptionId};
pub use executor::{HttpRefreshExecutor, RefreshExchange, RefreshGrant, REFRESH_PATH};
