//! Token acquisition for the streaming transport.
//!
//! The service issues short-lived tokens from an HTTP endpoint. A token is
//! cached and reused until it is about to expire; the refresh buffer
//! decides how early "about to expire" starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::config::Settings;
use crate::errors::{VocalsError, VocalsResult};

const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A transport token and its absolute expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct WsToken {
    pub token: String,
    pub expires_at: SystemTime,
}

impl WsToken {
    /// Whether the token expires within `buffer` from now (or already has).
    pub fn expires_within(&self, buffer: Duration) -> bool {
        match SystemTime::now().checked_add(buffer) {
            Some(deadline) => self.expires_at <= deadline,
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(rename = "expiresAt", alias = "expires_at")]
    expires_at: u64,
}

impl From<TokenResponse> for WsToken {
    fn from(resp: TokenResponse) -> Self {
        Self {
            token: resp.token,
            expires_at: UNIX_EPOCH + Duration::from_millis(resp.expires_at),
        }
    }
}

struct Inner {
    http: Client,
    url: Url,
    headers: HeaderMap,
    refresh_buffer: Duration,
    cached: Mutex<Option<WsToken>>,
}

/// Fetches and caches transport tokens.
#[derive(Clone)]
pub struct TokenProvider {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("url", &self.inner.url.as_str())
            .field("refresh_buffer", &self.inner.refresh_buffer)
            .finish()
    }
}

impl TokenProvider {
    pub fn new(settings: &Settings) -> VocalsResult<Self> {
        let url = settings.token_url()?;
        let headers = build_headers(&settings.headers)?;
        let http = Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| VocalsError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                url,
                headers,
                refresh_buffer: settings.refresh_buffer(),
                cached: Mutex::new(None),
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Return a valid token, fetching a new one when the cached token is
    /// missing or inside the refresh buffer.
    pub async fn token(&self) -> VocalsResult<WsToken> {
        let mut cached = self.inner.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && !token.expires_within(self.inner.refresh_buffer)
        {
            return Ok(token.clone());
        }

        if cached.is_some() {
            debug!("Cached token is within the refresh buffer, refreshing");
        }
        let token = self.fetch().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Fetch a fresh token, bypassing the cache.
    pub async fn fetch(&self) -> VocalsResult<WsToken> {
        let response = self
            .inner
            .http
            .post(self.inner.url.clone())
            .headers(self.inner.headers.clone())
            .send()
            .await
            .map_err(|e| VocalsError::Auth(format!("Token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VocalsError::Auth(format!(
                "Token endpoint returned {status}: {body}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| VocalsError::Auth(format!("Malformed token response: {e}")))?;

        info!(endpoint = %self.inner.url, "Fetched transport token");
        Ok(body.into())
    }

    /// Drop the cached token so the next call fetches a new one.
    pub async fn invalidate(&self) {
        *self.inner.cached.lock().await = None;
    }

    /// Currently cached token, if any.
    pub async fn cached(&self) -> Option<WsToken> {
        self.inner.cached.lock().await.clone()
    }
}

fn build_headers(headers: &HashMap<String, String>) -> VocalsResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| VocalsError::Config(format!("Invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| VocalsError::Config(format!("Invalid value for header '{name}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Attach `token` to the transport URL as the `token` query parameter.
pub fn authorize_url(url: &Url, token: &WsToken) -> Url {
    let mut url = url.clone();
    url.query_pairs_mut().append_pair("token", &token.token);
    url
}
