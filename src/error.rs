//! Error types for the relay.
//!
//! One enum, [`Error`], covers bus calls, transport capture, the shadow
//! connection and the wrapped library errors.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use realm_relay::{Result, Error};
//!
//! async fn example(api: &ExtensionApi) -> Result<()> {
//!     if !api.is_shadow_ready().await? {
//!         api.send_websocket_message("42[\"ping\"]", false).await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Bus | [`Error::RequestTimeout`], [`Error::UnhandledEvent`], [`Error::Remote`], [`Error::Protocol`] |
//! | Transport | [`Error::NoActiveTransport`], [`Error::MalformedFrame`], [`Error::Http`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::Handshake`], [`Error::ShadowNotReady`] |
//! | External | [`Error::Json`], [`Error::WebSocket`], [`Error::Url`] |
//!
//! Nothing here is fatal to the host: every failure resolves the affected
//! call with an error.

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::CorrelationId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Every failure the relay can report.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid relay settings.
    ///
    /// Returned by [`crate::config::RelayConfigBuilder::build`] on invalid input.
    #[error("Invalid configuration: {message}")]
    Config {
        /// Which setting was rejected and why.
        message: String,
    },

    // ========================================================================
    // Bus Errors
    // ========================================================================
    /// No reply arrived within the call's timeout.
    ///
    /// The correlation id is retired; a late reply is discarded.
    #[error("Call {correlation_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The correlation id that timed out.
        correlation_id: CorrelationId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The receiving realm has no handler for the event tag.
    #[error("Unhandled event: {event}")]
    UnhandledEvent {
        /// The event tag that had no handler.
        event: String,
    },

    /// The remote handler failed.
    #[error("Remote handler error: {message}")]
    Remote {
        /// Error message reported by the remote handler.
        message: String,
    },

    /// Protocol violation or unexpected message shape.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// No duplex or poll transport has been captured.
    #[error("No active transport connection found")]
    NoActiveTransport,

    /// A captured frame or poll unit could not be parsed.
    #[error("Malformed frame: {message}")]
    MalformedFrame {
        /// Description of the parse failure.
        message: String,
    },

    /// HTTP exchange failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// A socket or HTTP peer could not be reached, or dropped mid-exchange.
    #[error("Backend unreachable: {message}")]
    Connection {
        /// What went wrong with the peer.
        message: String,
    },

    /// Connection or bus endpoint closed while a call was in flight.
    #[error("Bus endpoint or socket closed")]
    ConnectionClosed,

    /// Shadow connection handshake failed.
    #[error("Handshake failed: {message}")]
    Handshake {
        /// Description of the handshake failure.
        message: String,
    },

    /// Shadow connection has not observed its acknowledgement yet.
    #[error("Shadow connection not ready")]
    ShadowNotReady,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// A payload failed to (de)serialize.
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Error from the duplex socket library.
    #[error("Socket error: {0}")]
    WebSocket(#[from] WsError),

    /// A configured or observed URL did not parse.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(correlation_id: CorrelationId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            correlation_id,
            timeout_ms,
        }
    }

    /// Creates an unhandled event error.
    #[inline]
    pub fn unhandled_event(event: impl Into<String>) -> Self {
        Self::UnhandledEvent {
            event: event.into(),
        }
    }

    /// Creates a remote handler error.
    #[inline]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a malformed frame error.
    #[inline]
    pub fn malformed_frame(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Whether a call gave up waiting for its reply.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Whether the failure came from the socket or HTTP layer.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::Handshake { .. }
                | Self::WebSocket(_)
        )
    }

    /// Whether retrying later can succeed.
    ///
    /// Covers timeouts, a missing transport and an unready or failed shadow
    /// connection.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. }
                | Self::NoActiveTransport
                | Self::Handshake { .. }
                | Self::ShadowNotReady
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
