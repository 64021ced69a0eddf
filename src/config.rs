//! Relay configuration and builder.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use realm_relay::RelayConfig;
//!
//! # fn example() -> realm_relay::Result<()> {
//! let config = RelayConfig::builder()
//!     .backend_url("https://chat.example.com")
//!     .fallback_grace(Duration::from_secs(5))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::protocol::address::has_query_pair;

// ============================================================================
// Defaults
// ============================================================================

/// Engine.io endpoint path on the backend.
const DEFAULT_SOCKET_PATH: &str = "/socket.io/";

/// Query pair marking connections opened by the shadow client.
const DEFAULT_SHADOW_MARKER: (&str, &str) = ("src", "relay");

/// Grace period before falling back to long-polling.
const DEFAULT_FALLBACK_GRACE: Duration = Duration::from_secs(5);

/// How long a wrapped duplex send waits for the extension to rewrite a frame.
const DEFAULT_SEND_REWRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long each poll unit waits for the extension to rewrite it.
const DEFAULT_POLL_REWRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Shadow handshake deadline.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Page URLs carrying this query parameter defer poll instrumentation.
const DEFAULT_DEFERRED_POLL_PARAM: &str = "q";

/// Maximum in-flight bus calls per endpoint.
const DEFAULT_MAX_PENDING_CALLS: usize = 100;

// ============================================================================
// RelayConfig
// ============================================================================

/// Validated relay configuration.
///
/// Shared by the interceptor, the shadow client and the bus endpoints.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Backend origin, e.g. `https://chat.example.com`.
    pub backend_url: Option<Url>,
    /// Engine.io endpoint path.
    pub socket_path: String,
    /// Query pair identifying the shadow connection.
    pub shadow_marker: (String, String),
    /// Delay before the poll fallback fires.
    pub fallback_grace: Duration,
    /// Timeout for the wrapped duplex `send` rewrite call.
    pub send_rewrite_timeout: Duration,
    /// Timeout for each poll-unit rewrite call.
    pub poll_rewrite_timeout: Duration,
    /// Shadow handshake deadline.
    pub handshake_timeout: Duration,
    /// Query parameter that defers poll instrumentation.
    pub deferred_poll_param: String,
    /// In-flight call limit per bus endpoint.
    pub max_pending_calls: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            shadow_marker: (
                DEFAULT_SHADOW_MARKER.0.to_string(),
                DEFAULT_SHADOW_MARKER.1.to_string(),
            ),
            fallback_grace: DEFAULT_FALLBACK_GRACE,
            send_rewrite_timeout: DEFAULT_SEND_REWRITE_TIMEOUT,
            poll_rewrite_timeout: DEFAULT_POLL_REWRITE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            deferred_poll_param: DEFAULT_DEFERRED_POLL_PARAM.to_string(),
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
        }
    }
}

impl RelayConfig {
    /// Creates a new builder.
    #[inline]
    #[must_use]
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::new()
    }

    /// Returns `true` if `url` carries the shadow marker query pair.
    ///
    /// Only an exact key and value match counts; unparsable URLs never do.
    #[must_use]
    pub fn is_shadow_url(&self, url: &str) -> bool {
        let (key, value) = &self.shadow_marker;
        has_query_pair(url, key, value)
    }

    /// Returns the backend URL or a configuration error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no backend URL was configured.
    pub fn require_backend(&self) -> Result<&Url> {
        self.backend_url
            .as_ref()
            .ok_or_else(|| Error::config("backend URL is required for the shadow connection"))
    }
}

// ============================================================================
// RelayConfigBuilder
// ============================================================================

/// Builder for [`RelayConfig`].
#[derive(Debug, Default, Clone)]
pub struct RelayConfigBuilder {
    backend_url: Option<String>,
    config: RelayConfig,
}

impl RelayConfigBuilder {
    /// Creates a builder holding the default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the backend origin.
    #[inline]
    #[must_use]
    pub fn backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = Some(url.into());
        self
    }

    /// Sets the engine.io endpoint path.
    #[inline]
    #[must_use]
    pub fn socket_path(mut self, path: impl Into<String>) -> Self {
        self.config.socket_path = path.into();
        self
    }

    /// Sets the query pair marking the shadow connection.
    #[inline]
    #[must_use]
    pub fn shadow_marker(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.shadow_marker = (key.into(), value.into());
        self
    }

    /// Sets the poll fallback grace period.
    #[inline]
    #[must_use]
    pub fn fallback_grace(mut self, grace: Duration) -> Self {
        self.config.fallback_grace = grace;
        self
    }

    /// Sets the duplex send rewrite timeout.
    #[inline]
    #[must_use]
    pub fn send_rewrite_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_rewrite_timeout = timeout;
        self
    }

    /// Sets the poll unit rewrite timeout.
    #[inline]
    #[must_use]
    pub fn poll_rewrite_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_rewrite_timeout = timeout;
        self
    }

    /// Sets the shadow handshake deadline.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Sets the query parameter that defers poll instrumentation.
    #[inline]
    #[must_use]
    pub fn deferred_poll_param(mut self, param: impl Into<String>) -> Self {
        self.config.deferred_poll_param = param.into();
        self
    }

    /// Sets the in-flight call limit per bus endpoint.
    #[inline]
    #[must_use]
    pub fn max_pending_calls(mut self, limit: usize) -> Self {
        self.config.max_pending_calls = limit;
        self
    }

    /// Builds the configuration with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the backend URL is not absolute http(s)
    /// - [`Error::Config`] if any timeout is zero
    /// - [`Error::Config`] if the pending call limit is zero
    pub fn build(self) -> Result<RelayConfig> {
        let mut config = self.config;

        if let Some(raw) = self.backend_url {
            let url = Url::parse(&raw)
                .map_err(|e| Error::config(format!("invalid backend URL '{raw}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::config(format!(
                    "backend URL must be http or https, got '{}'",
                    url.scheme()
                )));
            }
            config.backend_url = Some(url);
        }

        let timeouts = [
            ("fallback_grace", config.fallback_grace),
            ("send_rewrite_timeout", config.send_rewrite_timeout),
            ("poll_rewrite_timeout", config.poll_rewrite_timeout),
            ("handshake_timeout", config.handshake_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::config(format!("{name} must be greater than zero")));
        }

        if config.max_pending_calls == 0 {
            return Err(Error::config("max_pending_calls must be greater than zero"));
        }

        if !config.socket_path.starts_with('/') {
            config.socket_path.insert(0, '/');
        }

        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::builder().build().expect("defaults are valid");
        assert_eq!(config.fallback_grace, Duration::from_secs(5));
        assert_eq!(config.send_rewrite_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_rewrite_timeout, Duration::from_secs(1));
        assert_eq!(config.socket_path, "/socket.io/");
        assert!(config.backend_url.is_none());
    }

    #[test]
    fn test_backend_url_parsed() {
        let config = RelayConfig::builder()
            .backend_url("https://chat.example.com")
            .build()
            .expect("valid");
        let url = config.require_backend().expect("backend set");
        assert_eq!(url.host_str(), Some("chat.example.com"));
    }

    #[test]
    fn test_rejects_non_http_backend() {
        let err = RelayConfig::builder()
            .backend_url("ftp://chat.example.com")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = RelayConfig::builder()
            .poll_rewrite_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("poll_rewrite_timeout"));
    }

    #[test]
    fn test_require_backend_missing() {
        let config = RelayConfig::default();
        assert!(config.require_backend().is_err());
    }

    #[test]
    fn test_shadow_marker_detection() {
        let config = RelayConfig::builder()
            .shadow_marker("src", "mine")
            .build()
            .expect("valid");
        assert!(config.is_shadow_url("wss://x/socket.io/?EIO=4&src=mine"));
        assert!(!config.is_shadow_url("wss://x/socket.io/?EIO=4"));
        assert!(!config.is_shadow_url("wss://x/socket.io/?xsrc=mine"));
        assert!(!config.is_shadow_url("wss://x/socket.io/?src=mined"));
        assert!(!config.is_shadow_url("wss://x/socket.io/?q=src%3Dmine"));
        assert!(config.is_shadow_url("wss://x/socket.io/?sid=abc&src=mine&t=1"));
    }

    #[test]
    fn test_socket_path_normalized() {
        let config = RelayConfig::builder()
            .socket_path("engine/")
            .build()
            .expect("valid");
        assert_eq!(config.socket_path, "/engine/");
    }
}
