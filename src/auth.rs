//! OAuth2 client-credentials tokens for the Reddit API.

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

pub const DEFAULT_TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";

/// Tokens this close to expiry are refreshed before use.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed token response: {0}")]
    Payload(String),
}

#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct AuthToken {
    access_token: String,
    token_type: String,
    expires_at: Instant,
}

impl AuthToken {
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Value for an `Authorization` header, e.g. `bearer abc123`.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() + REFRESH_MARGIN >= self.expires_at
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: u64,
}

/// Hands out cached tokens and refreshes them when they expire.
///
/// The cache lock is held for the duration of a refresh, so callers that
/// find the token expired at the same time wait for a single exchange and
/// share its result.
pub struct TokenProvider {
    client: Client,
    token_url: Url,
    credentials: Credentials,
    cache: Mutex<Option<AuthToken>>,
}

impl TokenProvider {
    /// `client` should carry the user agent the API expects.
    pub fn new(client: Client, token_url: Url, credentials: Credentials) -> Self {
        Self {
            client,
            token_url,
            credentials,
            cache: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<AuthToken, AuthError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.clone());
        }

        let token = self.exchange().await?;
        *cache = Some(token.clone());
        Ok(token)
    }

    async fn exchange(&self) -> Result<AuthToken, AuthError> {
        debug!(url = %self.token_url, client_id = %self.credentials.client_id, "requesting access token");

        let resp = self
            .client
            .post(self.token_url.clone())
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(AuthError::Status { status, body });
        }

        let data: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::Payload(e.to_string()))?;
        if data.access_token.is_empty() {
            return Err(AuthError::Payload("empty access_token".into()));
        }

        let expires_at = Instant::now()
            .checked_add(Duration::from_secs(data.expires_in))
            .ok_or_else(|| {
                AuthError::Payload(format!("expires_in {} out of range", data.expires_in))
            })?;

        debug!(expires_in = data.expires_in, "access token refreshed");
        Ok(AuthToken {
            access_token: data.access_token,
            token_type: data.token_type,
            expires_at,
        })
    }
}

/// HTTP client that attaches a valid bearer token to every request.
///
/// Without a token provider requests go out anonymously.
#[derive(Clone)]
pub struct AuthorizedClient {
    client: Client,
    tokens: Option<Arc<TokenProvider>>,
}

impl AuthorizedClient {
    pub fn new(client: Client, tokens: Option<Arc<TokenProvider>>) -> Self {
        Self { client, tokens }
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some()
    }

    pub async fn get(&self, url: Url) -> Result<RequestBuilder, AuthError> {
        self.authorize(self.client.get(url)).await
    }

    pub async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, AuthError> {
        match &self.tokens {
            Some(tokens) => {
                let token = tokens.token().await?;
                Ok(request.header(AUTHORIZATION, token.header_value()))
            }
            None => Ok(request),
        }
    }
}
