use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{AccessCredential, CredentialStore, RefreshCredential};
use crate::api::{ApiClient, ApiError, ApiRequest};
use crate::config::Config;
use crate::refresh::{Coordinator, HttpRefreshExecutor, RefreshError};

/// Login endpoint, relative to the API base
const LOGIN_PATH: &str = "/api/token/";

/// Server-side logout (refresh credential blacklisting)
const LOGOUT_PATH: &str = "/api/usuario/logout/";

const REGISTER_PATH: &str = "/api/usuario/registro/";

/// Profile of the logged-in user
const PROFILE_PATH: &str = "/api/usuario/perfil/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub telefono: Option<String>,
    #[serde(default)]
    pub direccion: Option<String>,
    #[serde(default)]
    pub foto: Option<String>,
    #[serde(default)]
    pub date_joined: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// New account details
#[derive(Clone, Serialize)]
pub struct Registration {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access: String,
    refresh: String,
    profile: Profile,
}

/// Login, logout and startup restore on top of an [`ApiClient`].
#[derive(Clone)]
pub struct SessionManager {
    api: ApiClient,
}

impl SessionManager {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Wire up store, executor, coordinator and client from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let slot = config.refresh_slot()?;
        let store = Arc::new(CredentialStore::new(slot));

        let executor = HttpRefreshExecutor::new(config.api_base(), config.request_timeout())
            .context("Failed to build refresh client")?;
        let coordinator = Coordinator::new(store, Arc::new(executor));

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;
        let api = ApiClient::with_client(client, config.api_base(), coordinator);
        Ok(Self::new(api))
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn coordinator(&self) -> &Coordinator {
        self.api.coordinator()
    }

    /// Exchange email and password for a credential pair and start a session
    pub async fn login(&self, email: &str, password: &str) -> Result<Profile> {
        let response = self
            .api
            .http()
            .post(self.api.url(LOGIN_PATH))
            .header(header::ACCEPT, "application/json")
            .json(&LoginRequest { email, password })
            .send()
            .await
            .context("Failed to send login request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::Error::new(ApiError::from_status(status, &body)).context("Login rejected"));
        }

        let login: LoginResponse = response
            .json()
            .await
            .context("Failed to parse login response")?;

        if let Err(e) = self.coordinator().begin_session(
            AccessCredential::new(login.access),
            RefreshCredential::new(login.refresh),
        ) {
            warn!(error = %e, "Failed to persist refresh credential; session will not survive a restart");
        }

        info!(email = %login.profile.email, "Logged in");
        Ok(login.profile)
    }

    /// Create an account. Does not log in; call [`login`](Self::login)
    /// afterwards. Returns whatever the server echoes back.
    pub async fn register(&self, registration: &Registration) -> Result<serde_json::Value, ApiError> {
        let created = self.api.post_json(REGISTER_PATH, registration).await?;
        info!(email = %registration.email, "Account registered");
        Ok(created)
    }

    /// Fetch the current user's profile. Goes through the refreshing client,
    /// so an expired access credential is renewed on the way.
    pub async fn profile(&self) -> Result<Profile, ApiError> {
        self.api.get_json(PROFILE_PATH).await
    }

    /// Log out on the server (best effort) and forget local credentials
    pub async fn logout(&self) -> Result<()> {
        let refresh = match self.coordinator().store().get_refresh() {
            Ok(refresh) => refresh,
            Err(e) => {
                warn!(error = %e, "Could not read refresh credential for server logout");
                None
            }
        };

        if let Some(refresh) = refresh {
            let result = self
                .api
                .send(ApiRequest::post(LOGOUT_PATH).json(serde_json::json!({
                    "refresh": refresh.as_str(),
                })))
                .await;
            match result {
                Ok(response) if response.status().is_success() => debug!("Server logout accepted"),
                Ok(response) => debug!(status = %response.status(), "Server logout refused, ignoring"),
                Err(e) => debug!(error = %e, "Server logout failed, ignoring"),
            }
        }

        self.coordinator()
            .end_session()
            .context("Failed to clear stored credentials")?;
        info!("Logged out");
        Ok(())
    }

    /// Restore a session saved by a previous run by refreshing once.
    /// Returns `Ok(false)` when there is nothing to restore.
    pub async fn restore(&self) -> Result<bool, RefreshError> {
        match self.coordinator().store().get_refresh() {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(error = %e, "Stored refresh credential unreadable");
                return Ok(false);
            }
        }

        self.coordinator().ensure_fresh_credential().await?;
        info!("Session restored");
        Ok(true)
    }

    pub fn is_authenticated(&self) -> bool {
        self.coordinator().store().get_access().is_some()
    }

    /// Whether a refresh credential from an earlier session is stored
    pub fn has_stored_session(&self) -> Result<bool> {
        Ok(self
            .coordinator()
            .store()
            .get_refresh()
            .context("Failed to read stored refresh credential")?
            .is_some())
    }
}
