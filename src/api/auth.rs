use reqwest::Method;
use serde::Deserialize;
use serde_json::json;

use crate::types::StoredUser;

use super::{ApiClient, Result};

/// Response of `POST /api/auth/login`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSession {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    pub user: StoredUser,
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    user: StoredUser,
}

impl ApiClient {
    /// Authenticate with email and password, persisting the session locally.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        let body = json!({ "email": email, "password": password });
        let session: AuthSession = self
            .request_json(Method::POST, "/api/auth/login", &[], Some(&body))
            .await?;
        self.token_store().set_access_token(&session.access_token);
        self.token_store().set_user(&session.user);
        Ok(session)
    }

    /// End the session. The local session is dropped even when the backend
    /// call fails; the server-side cookie is then cleaned up on expiry.
    pub async fn logout(&self) -> Result<()> {
        let result: Result<serde_json::Value> = self
            .request_json(Method::POST, "/api/auth/logout", &[], None)
            .await;
        self.token_store().clear();
        if let Err(e) = result {
            tracing::warn!(
                target: "flechazo_client::api",
                "Logout request failed, local session dropped anyway: {}",
                e
            );
        }
        Ok(())
    }

    /// Fetch the authenticated user and refresh the persisted copy.
    pub async fn current_user(&self) -> Result<StoredUser> {
        let envelope: UserEnvelope = self
            .request_json(Method::GET, "/api/auth/me", &[], None)
            .await?;
        self.token_store().set_user(&envelope.user);
        Ok(envelope.user)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::token_store::TokenStore;

    use super::super::ApiError;
    use super::*;

    fn memory_client(base_url: &str) -> ApiClient {
        ApiClient::new(base_url, Arc::new(TokenStore::new(None))).expect("valid base url")
    }

    #[tokio::test]
    async fn login_persists_token_and_user() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/auth/login")
            .match_body(mockito::Matcher::Json(
                json!({ "email": "ana@uni.edu", "password": "secret" }),
            ))
            .with_status(200)
            .with_body(
                r#"{
                    "accessToken": "tok-1",
                    "user": { "id": "u1", "nombre": "Ana", "apellido": "Gomez" }
                }"#,
            )
            .create_async()
            .await;

        let client = memory_client(&server.url());
        let session = client.login("ana@uni.edu", "secret").await.expect("login ok");

        assert_eq!(session.user.id, "u1");
        assert_eq!(client.token_store().access_token().as_deref(), Some("tok-1"));
        assert_eq!(client.token_store().user().expect("stored").first_name, "Ana");
    }

    #[tokio::test]
    async fn logout_clears_session_even_when_backend_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/auth/logout")
            .with_status(500)
            .create_async()
            .await;
        // A 401 on logout triggers the transparent refresh path first.
        server
            .mock("POST", "/api/auth/refresh")
            .with_status(401)
            .create_async()
            .await;

        let client = memory_client(&server.url());
        client.token_store().set_access_token("tok-1");

        client.logout().await.expect("logout never errors");
        assert!(client.token_store().access_token().is_none());
        assert!(client.token_store().user().is_none());
    }

    #[tokio::test]
    async fn current_user_updates_stored_copy() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/auth/me")
            .with_status(200)
            .with_body(r#"{"user": {"id": "u1", "nombre": "Ana", "apellido": "Paz"}}"#)
            .create_async()
            .await;

        let client = memory_client(&server.url());
        client.token_store().set_access_token("tok-1");

        let user = client.current_user().await.expect("me ok");
        assert_eq!(user.last_name, "Paz");
        assert_eq!(client.token_store().user().expect("stored").last_name, "Paz");
    }

    #[tokio::test]
    async fn expired_session_on_me_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/auth/me")
            .with_status(401)
            .create_async()
            .await;
        server
            .mock("POST", "/api/auth/refresh")
            .with_status(401)
            .create_async()
            .await;

        let client = memory_client(&server.url());
        client.token_store().set_access_token("stale");

        let err = client.current_user().await.expect_err("session expired");
        assert!(matches!(err, ApiError::SessionExpired));
    }
}
