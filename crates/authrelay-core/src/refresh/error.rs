use reqwest::StatusCode;
use thiserror::Error;

use crate::api::error::truncate_body;

/// Why a refresh cycle could not produce a new access credential.
///
/// Every variant ends the current session: credentials are cleared and
/// session observers are notified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh credential available - please log in")]
    Missing,

    #[error("Network error during refresh: {0}")]
    Network(String),

    #[error("Refresh credential rejected: {0}")]
    Invalid(String),

    #[error("Server error during refresh: {0}")]
    ServerError(String),
}

impl RefreshError {
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let truncated = truncate_body(body);
        if status.is_client_error() {
            RefreshError::Invalid(format!("Status {}: {}", status, truncated))
        } else {
            RefreshError::ServerError(format!("Status {}: {}", status, truncated))
        }
    }

    /// True when the server was merely unreachable, as opposed to having
    /// rejected the credential
    pub fn is_transient(&self) -> bool {
        matches!(self, RefreshError::Network(_))
    }
}
