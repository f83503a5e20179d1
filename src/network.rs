//! HTTP client wrapper with error classification and transport retries.

use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use url::Url;

use crate::config::Config;

/// Accept header sent when probing for a companion Markdown document.
pub const MARKDOWN_ACCEPT: &str = "text/markdown,text/plain;q=0.9,*/*;q=0.8";
/// Accept header for ordinary HTML page fetches.
pub const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Buffered response body with its HTTP status.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub reason: String,
    pub text: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Request timeout")]
    Timeout,

    #[error("Connection refused - server not accepting connections")]
    ConnectionRefused,

    #[error("DNS resolution failed")]
    DnsError,

    #[error("SSL/TLS error - certificate or encryption issue")]
    SslError,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Failed to read response body: {0}")]
    BodyError(String),

    #[error("Content too large: {0} bytes (max: {1} bytes)")]
    ContentTooLarge(usize, usize),

    #[error("Failed to build HTTP client: {0}")]
    ClientBuildError(String),
}

impl FetchError {
    /// Transport-level failures eligible for retry; HTTP status codes never
    /// reach this path because non-2xx responses are returned as data.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout
                | FetchError::ConnectionRefused
                | FetchError::DnsError
                | FetchError::NetworkError(_)
                | FetchError::BodyError(_)
        )
    }

    fn from_reqwest_error(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return FetchError::Timeout;
        }

        let message = error.to_string().to_lowercase();
        if error.is_connect() {
            if message.contains("connection refused") {
                return FetchError::ConnectionRefused;
            }
            if message.contains("dns")
                || message.contains("name resolution")
                || message.contains("no such host")
            {
                return FetchError::DnsError;
            }
        }
        if message.contains("certificate") || message.contains("ssl") || message.contains("tls") {
            return FetchError::SslError;
        }

        FetchError::NetworkError(error.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    max_content_size: usize,
}

impl HttpClient {
    pub fn new(user_agent: &str, timeout_ms: u64) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_millis(timeout_ms))
            .gzip(true)
            .brotli(true)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| FetchError::ClientBuildError(e.to_string()))?;

        Ok(Self {
            client,
            max_content_size: Config::MAX_CONTENT_SIZE,
        })
    }

    /// Fetch a URL once and buffer the body. Non-2xx statuses are data, not
    /// errors; the caller decides what they mean.
    pub async fn fetch(&self, url: &Url, accept: &str) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .header("Accept", accept)
            .header("Accept-Language", "en-US,en;q=0.5")
            .send()
            .await
            .map_err(FetchError::from_reqwest_error)?;

        let status = response.status();
        if let Some(length) = response.content_length() {
            if length as usize > self.max_content_size {
                return Err(FetchError::ContentTooLarge(
                    length as usize,
                    self.max_content_size,
                ));
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::BodyError(e.to_string()))?;
        if body.len() > self.max_content_size {
            return Err(FetchError::ContentTooLarge(body.len(), self.max_content_size));
        }

        Ok(FetchResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            text: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    /// Fetch with up to `retries` additional attempts on transport errors.
    ///
    /// HTTP-level failures (any status code) are never retried here.
    pub async fn fetch_with_retries(
        &self,
        url: &Url,
        accept: &str,
        retries: u32,
    ) -> Result<FetchResponse, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch(url, accept).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transient() && attempt < retries => {
                    tracing::debug!(%url, %error, attempt, "transient fetch error, retrying");
                    tokio::time::sleep(retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Spacing before retry `attempt` (0-based).
///
/// The window doubles per attempt up to the cap, and a random quarter-window
/// on top spreads out retries that failed at the same instant.
fn retry_delay(attempt: u32) -> Duration {
    let window = Config::RETRY_BASE_DELAY_MS
        .saturating_mul(1u64 << attempt.min(4))
        .min(Config::RETRY_MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=window / 4);
    Duration::from_millis(window + jitter)
}
