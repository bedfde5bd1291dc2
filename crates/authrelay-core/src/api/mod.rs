//! REST API client module.
//!
//! This module provides the `ApiClient` for issuing authenticated requests.
//! Every request carries the current access credential as a bearer token;
//! a 401 hands off to the refresh `Coordinator` and the request is replayed
//! once with the credential it produces.

pub mod client;
pub mod error;
pub mod request;

pub use client::ApiClient;
pub use error::ApiError;
pub use request::ApiRequest;
