//! The network exchange that trades a refresh credential for a new pair.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RefreshError;
use crate::auth::{AccessCredential, RefreshCredential};

/// Path of the token refresh endpoint, relative to the API base
pub const REFRESH_PATH: &str = "/api/token/refresh/";

/// Result of a successful exchange. `refresh` is only present when the
/// server rotates refresh credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshGrant {
    pub access: AccessCredential,
    pub refresh: Option<RefreshCredential>,
}

/// Performs one refresh round trip. Implementations must not touch the
/// credential store or coordinator state.
#[async_trait]
pub trait RefreshExchange: Send + Sync {
    async fn exchange(&self, refresh: &RefreshCredential) -> Result<RefreshGrant, RefreshError>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// [`RefreshExchange`] over HTTP. Uses its own plain client so the refresh
/// call is never intercepted or retried.
#[derive(Clone)]
pub struct HttpRefreshExecutor {
    client: Client,
    url: String,
}

impl HttpRefreshExecutor {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_base))
    }

    /// Share an existing connection pool
    pub fn with_client(client: Client, api_base: &str) -> Self {
        Self {
            client,
            url: format!("{}{}", api_base.trim_end_matches('/'), REFRESH_PATH),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RefreshExchange for HttpRefreshExecutor {
    async fn exchange(&self, refresh: &RefreshCredential) -> Result<RefreshGrant, RefreshError> {
        debug!(url = %self.url, "Exchanging refresh credential");

        let response = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, "application/json")
            .json(&RefreshRequest {
                refresh: refresh.as_str(),
            })
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::from_status(status, &body));
        }

        let body: RefreshResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                RefreshError::ServerError(format!("Malformed refresh response: {}", e))
            } else {
                RefreshError::Network(e.to_string())
            }
        })?;

        Ok(RefreshGrant {
            access: AccessCredential::new(body.access),
            refresh: body.refresh.map(RefreshCredential::new),
        })
    }
}
