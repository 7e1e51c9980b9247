//! Token sources: the RunBeat token backend and a local refresh-token exchange.
//!
//! The orchestrator tries them in order; the first one to return a token wins.

use crate::error::{Result, SpotifyError};
use async_trait::async_trait;
use runbeat_core::{AccessToken, ServiceError, ServiceResult, TokenSource};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const LOG_TARGET: &str = "runbeat::spotify::token";

/// Token as returned by the backend's `spotify-token` endpoint.
#[derive(Debug, Deserialize)]
struct BackendTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Token as returned by the Spotify accounts service.
#[derive(Debug, Deserialize)]
struct AccountsTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

fn lifetime(expires_in: i64) -> Duration {
    Duration::from_secs(u64::try_from(expires_in).unwrap_or(0))
}

/// Send a request and decode a JSON body, turning error statuses into
/// [`SpotifyError::Status`].
async fn send_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let message = response.text().await.unwrap_or_default();
        return Err(SpotifyError::Status {
            status: status.as_u16(),
            retry_after,
            message,
        });
    }
    Ok(response.json().await?)
}

/// Fetches tokens from `GET {backend}/api/v1/users/{user_id}/spotify-token`.
///
/// The backend refreshes expired tokens itself, so no refresh token is needed here.
pub struct BackendTokenClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl BackendTokenClient {
    /// # Errors
    ///
    /// Returns an error if `backend_url` is not a valid base URL.
    pub fn new(client: reqwest::Client, backend_url: &str, user_id: &str) -> Result<Self> {
        let mut base = Url::parse(backend_url)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let endpoint = base.join(&format!("api/v1/users/{user_id}/spotify-token"))?;
        Ok(Self { client, endpoint })
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl TokenSource for BackendTokenClient {
    fn name(&self) -> &'static str {
        "backend"
    }

    async fn fetch_token(&self, current: Option<&AccessToken>) -> ServiceResult<AccessToken> {
        debug!(target: LOG_TARGET, "Requesting token from backend");
        let response: BackendTokenResponse = send_json(self.client.get(self.endpoint.clone()))
            .await
            .map_err(|err| match err {
                SpotifyError::Status { status: 404, .. } => ServiceError::AuthRevoked {
                    reason: "no Spotify tokens stored for this user".into(),
                },
                other => ServiceError::from(other),
            })?;

        info!(target: LOG_TARGET, "Obtained Spotify token from backend");
        Ok(AccessToken::new(
            response.access_token,
            response.refresh_token,
            lifetime(response.expires_in),
        )
        .inherit_refresh_token(current))
    }
}

/// Exchanges the stored refresh token at the Spotify accounts service.
pub struct LocalTokenRefresher {
    client: reqwest::Client,
    accounts_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl LocalTokenRefresher {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        accounts_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            client,
            accounts_url: accounts_url.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }
}

#[async_trait]
impl TokenSource for LocalTokenRefresher {
    fn name(&self) -> &'static str {
        "local_refresh"
    }

    async fn fetch_token(&self, current: Option<&AccessToken>) -> ServiceResult<AccessToken> {
        let refresh_token = current
            .and_then(|token| token.refresh_token.as_deref())
            .ok_or_else(|| ServiceError::AuthRevoked {
                reason: "no refresh token available".into(),
            })?;

        info!(target: LOG_TARGET, "Refreshing Spotify access token");
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let request = match &self.client_secret {
            Some(secret) => self
                .client
                .post(&self.accounts_url)
                .basic_auth(&self.client_id, Some(secret)),
            None => {
                form.push(("client_id", self.client_id.as_str()));
                self.client.post(&self.accounts_url)
            }
        };

        let response: AccountsTokenResponse = send_json(request.form(&form)).await?;
        Ok(AccessToken::new(
            response.access_token,
            response.refresh_token,
            lifetime(response.expires_in),
        )
        .inherit_refresh_token(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_endpoint_join() {
        let client = reqwest::Client::new();
        let with_path =
            BackendTokenClient::new(client.clone(), "https://runbeat.example.com/base", "user1")
                .unwrap();
        assert_eq!(
            with_path.endpoint().as_str(),
            "https://runbeat.example.com/base/api/v1/users/user1/spotify-token"
        );

        let bare = BackendTokenClient::new(client, "https://runbeat.example.com", "user1").unwrap();
        assert_eq!(
            bare.endpoint().as_str(),
            "https://runbeat.example.com/api/v1/users/user1/spotify-token"
        );
    }

    #[test]
    fn test_backend_response_parses() {
        let body = r#"{
            "access_token": "abc",
            "refresh_token": null,
            "expires_in": 3599,
            "token_type": "Bearer",
            "expires_at": "2024-05-01T10:00:00Z"
        }"#;
        let response: BackendTokenResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.access_token, "abc");
        assert!(response.refresh_token.is_none());
        assert_eq!(lifetime(response.expires_in), Duration::from_secs(3599));
        assert_eq!(lifetime(-5), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_local_refresh_requires_refresh_token() {
        let refresher = LocalTokenRefresher::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/api/token",
            "client",
            None,
        );
        let token = AccessToken::new("abc", None, Duration::from_secs(10));
        let result = refresher.fetch_token(Some(&token)).await;
        assert!(matches!(result, Err(ServiceError::AuthRevoked { .. })));
    }
}
