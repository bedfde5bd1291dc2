//! API client that attaches the access credential and recovers from an
//! expired one.
//!
//! A request rejected with 401 is handed to the [`Coordinator`], which
//! refreshes the credential (or waits for the refresh already running), and
//! is then replayed exactly once. A replay that is rejected again is returned
//! as is; it never triggers another refresh.

use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::{ApiError, ApiRequest};
use crate::auth::AccessCredential;
use crate::refresh::Coordinator;

/// HTTP request timeout in seconds
pub const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Clone is cheap - reqwest::Client and Coordinator are both Arc inside.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    coordinator: Coordinator,
}

impl ApiClient {
    pub fn new(base_url: &str, coordinator: Coordinator) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self::with_client(client, base_url, coordinator))
    }

    /// Share an existing connection pool
    pub fn with_client(client: Client, base_url: &str, coordinator: Coordinator) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The underlying client, for calls that must bypass credential handling
    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    pub(crate) fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn build(
        &self,
        request: &ApiRequest,
        credential: Option<&AccessCredential>,
    ) -> Result<RequestBuilder, ApiError> {
        let mut headers = request.headers().clone();
        // The current credential replaces any caller-supplied Authorization
        if let Some(credential) = credential {
            let value = header::HeaderValue::from_str(&credential.bearer())
                .map_err(|e| ApiError::InvalidRequest(format!("Unusable access credential: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let mut builder = self
            .client
            .request(request.method().clone(), self.url(request.path()))
            .headers(headers);

        if !request.query_pairs().is_empty() {
            builder = builder.query(request.query_pairs());
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }
        Ok(builder)
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        credential: Option<&AccessCredential>,
    ) -> Result<Response, ApiError> {
        Ok(self.build(request, credential)?.send().await?)
    }

    /// Send a request with the current access credential.
    ///
    /// Any response other than 401 is returned untouched, success or not.
    /// On a first 401 the credential is refreshed and the request replayed
    /// once; if the refresh fails its error is returned and nothing is
    /// replayed.
    pub async fn send(&self, request: ApiRequest) -> Result<Response, ApiError> {
        let credential = self.coordinator.store().get_access();
        let response = self.dispatch(&request, credential.as_ref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let descriptor = request.descriptor();
        debug!(request = %descriptor, "Authorization rejected, refreshing credential");
        let fresh = self
            .coordinator
            .ensure_fresh_credential_after(&descriptor, credential.as_ref())
            .await?;

        debug!(request = %descriptor, "Replaying request with fresh credential");
        self.dispatch(&request, Some(&fresh)).await
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let descriptor = request.descriptor();
        let response = Self::check_response(self.send(request).await?).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", descriptor, e)))
    }

    fn body_value<B: Serialize>(body: &B) -> Result<serde_json::Value, ApiError> {
        serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to serialize body: {}", e)))
    }

    // ===== Typed helpers =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(ApiRequest::post(path).json(Self::body_value(body)?))
            .await
    }

    pub async fn patch_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(ApiRequest::patch(path).json(Self::body_value(body)?))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        Self::check_response(self.send(ApiRequest::delete(path)).await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::{CredentialStore, MemorySlot};
    use crate::refresh::HttpRefreshExecutor;

    fn client(base_url: &str) -> ApiClient {
        let store = Arc::new(CredentialStore::new(Box::new(MemorySlot::new())));
        let executor = HttpRefreshExecutor::with_client(Client::new(), base_url);
        let coordinator = Coordinator::new(store, Arc::new(executor));
        ApiClient::new(base_url, coordinator).unwrap()
    }

    #[test]
    fn test_url_joining() {
        let api = client("http://localhost:8000/");
        assert_eq!(api.base_url(), "http://localhost:8000");
        assert_eq!(api.url("/api/usuario/perfil/"), "http://localhost:8000/api/usuario/perfil/");
        assert_eq!(api.url("api/rutas/"), "http://localhost:8000/api/rutas/");
    }

    #[test]
    fn test_build_attaches_bearer() {
        let api = client("http://localhost:8000");
        let request = ApiRequest::get("/api/rutas/").query("page", 1);

        let built = api
            .build(&request, Some(&AccessCredential::new("A1")))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(built.url().as_str(), "http://localhost:8000/api/rutas/?page=1");
        assert_eq!(built.headers()[header::AUTHORIZATION], "Bearer A1");

        let anonymous = api.build(&request, None).unwrap().build().unwrap();
        assert!(anonymous.headers().get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_build_replaces_caller_authorization() {
        let api = client("http://localhost:8000");
        let request = ApiRequest::get("/api/rutas/").header(
            header::AUTHORIZATION,
            header::HeaderValue::from_static("Bearer caller"),
        );

        let built = api
            .build(&request, Some(&AccessCredential::new("A1")))
            .unwrap()
            .build()
            .unwrap();
        let values: Vec<_> = built.headers().get_all(header::AUTHORIZATION).iter().collect();
        assert_eq!(values, vec!["Bearer A1"]);

        // Without a session the caller's header is sent as given
        let anonymous = api.build(&request, None).unwrap().build().unwrap();
        assert_eq!(anonymous.headers()[header::AUTHORIZATION], "Bearer caller");
    }

    #[test]
    fn test_build_rejects_unprintable_credential() {
        let api = client("http://localhost:8000");
        let result = api.build(&ApiRequest::get("/"), Some(&AccessCredential::new("bad\ntoken")));
        assert!(matches!(result, Err(ApiError::InvalidRequest(_))));
    }
}
