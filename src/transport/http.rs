//! Long-poll HTTP client.
//!
//! Poll exchanges and the shadow handshake's opening request go through a
//! [`PollClient`]; [`HttpPollClient`] is the reqwest-backed implementation.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Engine.io polling bodies are plain UTF-8 text.
const POLL_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";

/// Per-exchange deadline.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// PollClient
// ============================================================================

/// One-shot HTTP exchanges against a polling endpoint.
#[async_trait]
pub trait PollClient: Send + Sync {
    /// Fetches a polling body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] or [`Error::Connection`] on failure.
    async fn get(&self, url: &Url) -> Result<String>;

    /// Posts a polling body and returns the response text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] or [`Error::Connection`] on failure.
    async fn post(&self, url: &Url, body: String) -> Result<String>;
}

// ============================================================================
// HttpPollClient
// ============================================================================

/// reqwest-backed [`PollClient`].
#[derive(Debug, Clone)]
pub struct HttpPollClient {
    client: reqwest::Client,
}

impl HttpPollClient {
    /// Creates a client with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the TLS backend fails to initialise.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(EXCHANGE_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing reqwest client.
    #[inline]
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn read_body(url: &Url, response: reqwest::Response) -> Result<String> {
        let status = response.status();
        if !status.is_success() {
            debug!(%url, %status, "Poll exchange rejected");
            return Err(Error::connection(format!("{url} answered {status}")));
        }
        let body = response.text().await?;
        trace!(%url, len = body.len(), "Poll exchange complete");
        Ok(body)
    }
}

#[async_trait]
impl PollClient for HttpPollClient {
    async fn get(&self, url: &Url) -> Result<String> {
        let response = self.client.get(url.clone()).send().await?;
        Self::read_body(url, response).await
    }

    async fn post(&self, url: &Url, body: String) -> Result<String> {
        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, POLL_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        Self::read_body(url, response).await
    }
}
