//! Cross-realm message bus.
//!
//! Each realm owns one [`BusEndpoint`]. Endpoints are joined by a [`Link`],
//! a pair of text channels carrying encoded envelopes and replies.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                          ┌──────────────────┐
//! │  Page realm      │        Envelope          │  Extension realm │
//! │                  │ ───────────────────────► │                  │
//! │  BusEndpoint     │                          │  BusEndpoint     │
//! │  (correlation)   │ ◄─────────────────────── │  (handlers)      │
//! │                  │          Reply           │                  │
//! └──────────────────┘                          └──────────────────┘
//! ```
//!
//! # Call Lifecycle
//!
//! 1. `send` mints a correlation id and registers a pending resolver
//! 2. The receiving realm routes the envelope to the handler for its tag
//! 3. The handler's value (or error) travels back as a `Reply`
//! 4. The resolver fires, or the call times out and the id is retired

// ============================================================================
// Submodules
// ============================================================================

/// Bus endpoint and event loop.
pub mod endpoint;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use tokio::sync::mpsc;

use crate::config::RelayConfig;

// ============================================================================
// Re-exports
// ============================================================================

pub use endpoint::{BusEndpoint, Handler, HandlerFuture};

// ============================================================================
// Realm
// ============================================================================

/// An isolated execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Realm {
    /// Untrusted realm where the observed application runs.
    Page,
    /// Isolated extension realm.
    Extension,
    /// Privileged background realm.
    Background,
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page => f.write_str("page"),
            Self::Extension => f.write_str("extension"),
            Self::Background => f.write_str("background"),
        }
    }
}

// ============================================================================
// Link
// ============================================================================

/// One side of a realm-to-realm channel.
///
/// Only encoded text crosses a link; realms share no objects.
#[derive(Debug)]
pub struct Link {
    /// Frames to the peer realm.
    pub(crate) outbound: mpsc::UnboundedSender<String>,
    /// Frames from the peer realm.
    pub(crate) inbound: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Creates a crossed pair of links.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: a_tx,
                inbound: b_rx,
            },
            Self {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }

    /// Builds a link from raw channel halves.
    ///
    /// Useful when frames are carried over another medium.
    #[must_use]
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

/// Connects two realms with default limits.
///
/// Must be called inside a tokio runtime.
#[must_use]
pub fn pair(a: Realm, b: Realm) -> (BusEndpoint, BusEndpoint) {
    let (link_a, link_b) = Link::pair();
    (BusEndpoint::new(a, link_a), BusEndpoint::new(b, link_b))
}

/// Connects two realms, limiting in-flight calls per endpoint to
/// `config.max_pending_calls`.
///
/// Must be called inside a tokio runtime.
#[must_use]
pub fn pair_with_config(a: Realm, b: Realm, config: &RelayConfig) -> (BusEndpoint, BusEndpoint) {
    let (link_a, link_b) = Link::pair();
    let limit = config.max_pending_calls;
    (
        BusEndpoint::with_max_pending(a, link_a, limit),
        BusEndpoint::with_max_pending(b, link_b, limit),
    )
}

// ============================================================================
// Tests
// ============================================================================
