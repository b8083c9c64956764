// LoanLiberator - Library Loan Archiver
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! HTTP client for the library catalog service
//!
//! # Features
//! - Fixed mobile-app header set on every request
//! - Bearer token and `patron-id` headers from an explicit [`Session`]
//! - Retry with exponential backoff on transient failures
//! - Streaming downloads straight to disk
//!
//! ## Retry Strategy
//! - Maximum 3 attempts (1 initial + 2 retries)
//! - Exponential backoff: 1s, 2s, 4s between retries
//! - Retry on: network timeouts and connect errors, 5xx, 429
//! - No retry on: other 4xx client errors
//!
//! # Endpoints
//! | Operation          | Method | Path                                                        |
//! |--------------------|--------|-------------------------------------------------------------|
//! | token exchange     | POST   | `/core/tokens` (form: username, password)                   |
//! | user lookup        | GET    | `/core/users`                                               |
//! | borrowed titles    | GET    | `/core/users/{user}/borrowed-titles`                        |
//! | title info         | GET    | `/core/v2/titles/{title}`                                   |
//! | title details      | GET    | `/core/titles/{title}` (carries audiobook chapters)         |
//! | borrows remaining  | GET    | `/core/users/{user}/patrons/{patron}/borrows-remaining`     |
//! | borrow             | POST   | `/core/users/{user}/patrons/{patron}/borrowed-titles/{id}`  |
//! | archive location   | GET    | `/core/v2/patrons/downloads/{media key}/url` (redirect)     |
//! | wrapped file key   | GET    | `/license/downloads/book/key/{media key}` (base64 text)     |
//! | playback token     | GET    | `/license/castlabs/upfront-auth-tokens/{mk}/{patron}/{circ}`|

use super::models::{BorrowResponse, BorrowsRemaining, ContentItem, TitleRecord, TokenResponse, UserRecord};
use super::source::{ContentSource, Session};
use crate::crypto::WrappedKey;
use crate::error::{LiberatorError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, LOCATION, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

/// Catalog gateway root
pub const DEFAULT_BASE_URL: &str = "https://patron-api-gateway.hoopladigital.com";

/// Cover image host; `{media key}_{size}.jpeg`
pub const COVER_BASE_URL: &str = "http://d2snwnmzyr8jue.cloudfront.net";

/// Maximum retry attempts (1 initial + 2 retries = 3 total)
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Initial retry delay in seconds (exponential backoff: 1s, 2s, 4s)
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Headers the mobile app sends with every call
const APP_HEADERS: &[(&str, &str)] = &[
    ("app", "ANDROID"),
    ("app-version", "4.53.4"),
    ("device-module", "KFKAWI"),
    ("device-version", ""),
    ("hoopla-verson", "4.53.4"),
    ("kids-mode", "false"),
    ("os", "ANDROID"),
    ("os-version", "6.0.1"),
    ("ws-api", "2.1"),
];

const APP_USER_AGENT: &str = "Hoopla Android/4.27";

/// Small cover embedded in audiobooks
pub fn small_cover_url(media_key: &str) -> String {
    format!("{}/{}_540.jpeg", COVER_BASE_URL, media_key)
}

/// Large cover saved beside audiobooks
pub fn large_cover_url(media_key: &str) -> String {
    format!("{}/{}_1080.jpeg", COVER_BASE_URL, media_key)
}

/// Configuration for CatalogClient
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: MAX_RETRY_ATTEMPTS,
            user_agent: APP_USER_AGENT.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.config.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries.max(1);
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Catalog service client
///
/// Holds no session state; every authenticated call takes a [`Session`].
#[derive(Debug, Clone)]
pub struct CatalogClient {
    client: Client,
    /// Same settings, but redirects are returned instead of followed
    no_redirect: Client,
    config: ClientConfig,
}

impl CatalogClient {
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in APP_HEADERS {
            headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| LiberatorError::InvalidInput(format!("Invalid user agent: {}", e)))?,
        );

        let builder = || {
            Client::builder()
                .timeout(config.timeout)
                .default_headers(headers.clone())
                .pool_max_idle_per_host(10)
                .pool_idle_timeout(Duration::from_secs(90))
        };

        let client = builder().build()?;
        let no_redirect = builder().redirect(reqwest::redirect::Policy::none()).build()?;

        Ok(Self {
            client,
            no_redirect,
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn core_url(&self, path: &str) -> String {
        format!("{}/core{}", self.config.base_url, path)
    }

    fn license_url(&self, path: &str) -> String {
        format!("{}/license{}", self.config.base_url, path)
    }

    /// Exchange credentials for a token, then resolve user and patron ids
    ///
    /// # Errors
    /// `AuthenticationFailed` when the token status is not `SUCCESS` or the
    /// user has no patron record.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let url = self.core_url("/tokens");
        let form = [("username", username), ("password", password)];
        let response: TokenResponse = self
            .send_json(|| self.client.post(&url).form(&form))
            .await?;

        let token = match (response.token_status.as_deref(), response.token) {
            (Some("SUCCESS"), Some(token)) if !token.is_empty() => token,
            _ => {
                return Err(LiberatorError::AuthenticationFailed {
                    message: response.message.unwrap_or_else(|| "Failed to get token".to_string()),
                })
            }
        };

        let url = self.core_url("/users");
        let user: UserRecord = self
            .send_json(|| self.client.get(&url).header(AUTHORIZATION, bearer(&token)))
            .await?;

        let patron_id = user
            .patrons
            .first()
            .map(|p| p.id)
            .ok_or_else(|| LiberatorError::AuthenticationFailed {
                message: format!("user {} has no patron record", user.id),
            })?;

        tracing::info!(user_id = user.id, patron_id, patrons = user.patrons.len(), "logged in");
        Ok(Session::new(token, user.id, patron_id))
    }

    fn authed(&self, builder: RequestBuilder, session: &Session) -> RequestBuilder {
        builder
            .header(AUTHORIZATION, bearer(session.token()))
            .header("patron-id", session.patron_id.to_string())
    }

    /// Send with retry; success responses are returned as-is
    async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < self.config.max_retries {
            attempts += 1;

            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    match status {
                        s if s.is_success() || s.is_redirection() => return Ok(response),

                        // 5xx and 429 - retry with backoff
                        s if (s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
                            && attempts < self.config.max_retries =>
                        {
                            let endpoint = response.url().path().to_string();
                            let body = response.text().await.unwrap_or_default();
                            tracing::warn!(%endpoint, status = s.as_u16(), attempts, "transient API failure, retrying");
                            last_error = Some(LiberatorError::api_failed(
                                format!("Server error: {}", body),
                                Some(status.as_u16()),
                                Some(endpoint),
                            ));
                            sleep(backoff(attempts)).await;
                            continue;
                        }

                        _ => return Err(error_from_response(response).await),
                    }
                }

                // Network error - retry with backoff
                Err(e) if attempts < self.config.max_retries && is_retryable_network_error(&e) => {
                    tracing::warn!(error = %e, attempts, "network failure, retrying");
                    last_error = Some(LiberatorError::network_error(
                        format!("Network request failed: {}", e),
                        true,
                    ));
                    sleep(backoff(attempts)).await;
                }

                Err(e) => {
                    let transient = is_retryable_network_error(&e);
                    return Err(LiberatorError::network_error(
                        format!("Network request failed: {}", e),
                        transient,
                    ));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LiberatorError::ApiRequestFailed {
            message: format!("Request failed after {} attempts", attempts),
            status_code: None,
            endpoint: None,
        }))
    }

    async fn send_json<T, F>(&self, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let response = self.send_with_retry(build).await?;
        parse_json(response).await
    }

    async fn send_text<F>(&self, build: F) -> Result<String>
    where
        F: Fn() -> RequestBuilder,
    {
        let response = self.send_with_retry(build).await?;
        let status = response.status();
        response.text().await.map_err(|e| LiberatorError::ApiRequestFailed {
            message: format!("Failed to read response body: {}", e),
            status_code: Some(status.as_u16()),
            endpoint: None,
        })
    }

    /// Stream a response body into `destination`; returns bytes written
    async fn stream_to_file(response: Response, destination: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| LiberatorError::file_io("create", destination, e))?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LiberatorError::network_error(format!("Download interrupted: {}", e), true))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| LiberatorError::file_io("write", destination, e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| LiberatorError::file_io("flush", destination, e))?;

        Ok(written)
    }
}

#[async_trait]
impl ContentSource for CatalogClient {
    async fn borrowed_titles(&self, session: &Session) -> Result<Vec<TitleRecord>> {
        let url = self.core_url(&format!("/users/{}/borrowed-titles", session.user_id));
        self.send_json(|| self.authed(self.client.get(&url), session)).await
    }

    async fn title_info(&self, session: &Session, title_id: i64) -> Result<TitleRecord> {
        let url = self.core_url(&format!("/v2/titles/{}", title_id));
        self.send_json(|| self.authed(self.client.get(&url), session)).await
    }

    async fn title_details(&self, session: &Session, title_id: i64) -> Result<TitleRecord> {
        let url = self.core_url(&format!("/titles/{}", title_id));
        self.send_json(|| self.authed(self.client.get(&url), session)).await
    }

    async fn borrows_remaining(&self, session: &Session) -> Result<BorrowsRemaining> {
        let url = self.core_url(&format!(
            "/users/{}/patrons/{}/borrows-remaining",
            session.user_id, session.patron_id
        ));
        self.send_json(|| self.authed(self.client.get(&url), session)).await
    }

    async fn borrow(&self, session: &Session, title_id: i64) -> Result<BorrowResponse> {
        let url = self.core_url(&format!(
            "/users/{}/patrons/{}/borrowed-titles/{}",
            session.user_id, session.patron_id, title_id
        ));
        self.send_json(|| self.authed(self.client.post(&url), session)).await
    }

    async fn download_archive(&self, session: &Session, item: &ContentItem, destination: &Path) -> Result<u64> {
        let url = self.core_url(&format!("/v2/patrons/downloads/{}/url", item.media_key));
        let response = self
            .send_with_retry(|| self.authed(self.no_redirect.get(&url), session))
            .await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| LiberatorError::InvalidApiResponse {
                message: "Redirect URL not found in response headers".to_string(),
                response_body: None,
            })?;

        tracing::debug!(circ_id = item.circ_id, "archive location resolved");
        let response = self.send_with_retry(|| self.client.get(&location)).await?;
        let bytes = Self::stream_to_file(response, destination).await?;
        tracing::info!(circ_id = item.circ_id, bytes, "archive downloaded");
        Ok(bytes)
    }

    async fn wrapped_key(&self, session: &Session, item: &ContentItem) -> Result<WrappedKey> {
        let url = self.license_url(&format!("/downloads/book/key/{}", item.media_key));
        let text = self
            .send_text(|| self.authed(self.client.get(&url), session))
            .await?;
        WrappedKey::from_base64(&item.media_key, item.circ_id, session.patron_id, text.trim())
    }

    async fn playback_token(&self, session: &Session, item: &ContentItem) -> Result<String> {
        let url = self.license_url(&format!(
            "/castlabs/upfront-auth-tokens/{}/{}/{}",
            item.media_key, session.patron_id, item.circ_id
        ));
        let token = self
            .send_text(|| self.authed(self.client.get(&url), session))
            .await?;
        Ok(token.trim().to_string())
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        self.send_text(|| self.client.get(url)).await
    }

    async fn download_file(&self, url: &str, destination: &Path) -> Result<u64> {
        let response = self.send_with_retry(|| self.client.get(url)).await?;
        Self::stream_to_file(response, destination).await
    }
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(INITIAL_RETRY_DELAY_SECS * 2_u64.pow(attempt.saturating_sub(1)))
}

fn is_retryable_network_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

async fn error_from_response(response: Response) -> LiberatorError {
    let status = response.status();
    let endpoint = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return LiberatorError::AuthenticationFailed {
            message: format!("{} on {}", status, endpoint),
        };
    }

    LiberatorError::api_failed(
        format!("API request failed: {}", body),
        Some(status.as_u16()),
        Some(endpoint),
    )
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let endpoint = response.url().path().to_string();
    let text = response.text().await.map_err(|e| LiberatorError::ApiRequestFailed {
        message: format!("Failed to read response body: {}", e),
        status_code: Some(status.as_u16()),
        endpoint: Some(endpoint),
    })?;

    serde_json::from_str::<T>(&text).map_err(|e| {
        let snippet: String = text.chars().take(400).collect();
        LiberatorError::InvalidApiResponse {
            message: format!("Parse error: {} at line {} col {}", e, e.line(), e.column()),
            response_body: Some(snippet),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::builder()
            .base_url("http://localhost:8080/")
            .timeout(Duration::from_secs(60))
            .max_retries(0)
            .user_agent("TestAgent/1.0")
            .build();

        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.user_agent, "TestAgent/1.0");
    }

    #[test]
    fn test_endpoint_urls() {
        let client = CatalogClient::with_config(
            ClientConfig::builder().base_url("http://gateway").build(),
        )
        .unwrap();
        assert_eq!(client.core_url("/users"), "http://gateway/core/users");
        assert_eq!(
            client.license_url("/downloads/book/key/mk"),
            "http://gateway/license/downloads/book/key/mk"
        );
    }

    #[test]
    fn test_cover_urls() {
        assert_eq!(small_cover_url("mk"), "http://d2snwnmzyr8jue.cloudfront.net/mk_540.jpeg");
        assert_eq!(large_cover_url("mk"), "http://d2snwnmzyr8jue.cloudfront.net/mk_1080.jpeg");
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(4));
    }
}
