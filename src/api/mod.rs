use std::sync::Arc;

use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::token_store::TokenStore;

mod auth;
mod chat;

pub use auth::AuthSession;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid base url: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Backend rejected the request ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Session expired, log in again")]
    SessionExpired,
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// Body shape of `POST /api/auth/refresh`.
#[derive(Debug, serde::Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

/// Endpoints that must not trigger a transparent token refresh on 401:
/// a 401 from these is the actual answer, not a stale-token symptom.
fn is_refresh_exempt(path: &str) -> bool {
    path.starts_with("/api/auth/refresh")
        || path.starts_with("/api/auth/login")
        || path.starts_with("/api/auth/register")
}

/// Authenticated REST client for the backend.
///
/// Every attempt reads the current access token from the [`TokenStore`] at
/// send time, so a refresh performed by any component is picked up by the
/// next request. A 401 on a non-auth endpoint triggers exactly one refresh
/// and one replay; a second 401 ends the session.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    token_store: Arc<TokenStore>,
    refresh_lock: Arc<Mutex<()>>,
}

impl ApiClient {
    pub fn new(base_url: &str, token_store: Arc<TokenStore>) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(format!("{base_url}: {e}")))?;
        // Cookie store holds the refresh credential the backend sets.
        let http = Client::builder().cookie_store(true).build()?;
        Ok(Self {
            http,
            base_url,
            token_store,
            refresh_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.token_store
    }

    /// Force a token refresh, independent of any in-flight request.
    ///
    /// Used by the realtime manager when the handshake is rejected. Failure
    /// clears the persisted session: the refresh credential itself is no
    /// longer honored, so the user has to log in again.
    pub async fn refresh_access_token(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Refresh after a 401, coalescing concurrent callers: whoever waited on
    /// the lock while another task refreshed reuses the fresh token instead
    /// of spending the (single-use) refresh credential again.
    async fn refresh_after_unauthorized(&self, stale: Option<&str>) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(current) = self.token_store.access_token() {
            if Some(current.as_str()) != stale {
                return Ok(current);
            }
        }
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<String> {
        let url = self.endpoint("/api/auth/refresh")?;
        let response = self.http.post(url).send().await?;
        if !response.status().is_success() {
            tracing::warn!(
                target: "flechazo_client::api",
                "Token refresh rejected ({}), clearing session",
                response.status()
            );
            self.token_store.clear();
            return Err(ApiError::SessionExpired);
        }
        let body: RefreshResponse = response.json().await?;
        self.token_store.set_access_token(&body.access_token);
        tracing::debug!(target: "flechazo_client::api", "Access token refreshed");
        Ok(body.access_token)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(format!("{path}: {e}")))
    }

    /// Issue a request with bearer auth and the one-shot refresh-and-replay
    /// behavior, then deserialize the JSON response.
    pub(crate) async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T> {
        let used_token = self.token_store.access_token();
        let response = self.attempt(&method, path, query, body).await?;

        if response.status() == StatusCode::UNAUTHORIZED && !is_refresh_exempt(path) {
            self.refresh_after_unauthorized(used_token.as_deref())
                .await?;
            let retried = self.attempt(&method, path, query, body).await?;
            if retried.status() == StatusCode::UNAUTHORIZED {
                self.token_store.clear();
                return Err(ApiError::SessionExpired);
            }
            return Self::parse_response(retried).await;
        }

        Self::parse_response(response).await
    }

    /// One raw attempt, with the freshest token attached.
    async fn attempt(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Response> {
        let url = self.endpoint(path)?;
        let mut builder = self.http.request(method.clone(), url);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(token) = self.token_store.access_token() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.send().await?)
    }

    async fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        // Backend errors carry `{ "message": "..." }` when they have one.
        let message = response
            .text()
            .await
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            .and_then(|v| v["message"].as_str().map(str::to_owned))
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }
}
