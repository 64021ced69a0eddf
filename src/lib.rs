//! Realm Relay - cross-realm messaging and realtime transport interception.
//!
//! This library lets mutually isolated execution realms exchange typed,
//! correlated calls, and uses that bus to observe and drive a web
//! application's own realtime transport.
//!
//! # Architecture
//!
//! - **Page realm**: runs next to the application. The [`Interceptor`]
//!   captures its duplex socket or long-poll exchanges; the [`ShadowClient`]
//!   keeps an independent connection to the same backend.
//! - **Extension realm**: issues commands ("send this frame", "which
//!   transport is active") and observes forwarded transport events.
//!
//! Key design principles:
//!
//! - Each realm owns one [`BusEndpoint`]: event loop + correlation map
//! - Every bus message is a [`BusMessage`] tagged by `event`
//! - Captured sockets are wrapped in a decorator, never patched in place
//! - Realm state lives in explicit context objects ([`PageRelay`])
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use realm_relay::{ExtensionApi, HttpPollClient, PageRelay, Realm, RelayConfig, Result, bus};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = RelayConfig::builder()
//!         .backend_url("https://chat.example.com")
//!         .build()?;
//!
//!     // Join the two realms
//!     let (page, extension) = bus::pair_with_config(Realm::Page, Realm::Extension, &config);
//!
//!     // Page side: intercept and answer queries
//!     let relay = PageRelay::new(config, page, Arc::new(HttpPollClient::new()?));
//!     relay.install("https://chat.example.com/c/123");
//!
//!     // Extension side: pass outbound frames through unchanged
//!     let api = ExtensionApi::new(extension);
//!     api.on_transport_event(|event| async move { Ok(Some(event.payload)) });
//!
//!     let outcome = api.send_websocket_message("42[\"hello\"]", false).await?;
//!     println!("Sent: {outcome:?}");
//!
//!     relay.teardown();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bus`] | Cross-realm message bus |
//! | [`config`] | Relay configuration and builder |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`interceptor`] | Transport capture, fallback and subscriptions |
//! | [`protocol`] | Bus envelopes and engine.io framing |
//! | [`relay`] | Page context and extension capability surface |
//! | [`shadow`] | Independent backend connection |
//! | [`transport`] | Duplex sockets and poll handles |

// ============================================================================
// Modules
// ============================================================================

/// Cross-realm message bus.
///
/// Use [`bus::pair`] to join two realms.
pub mod bus;

/// Relay configuration.
///
/// Use [`RelayConfig::builder()`] to create a validated configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Transport interception and fallback.
pub mod interceptor;

/// Wire formats: bus envelopes, typed messages, engine.io frames.
pub mod protocol;

/// Realm-level entry points.
pub mod relay;

/// Shadow connection.
pub mod shadow;

/// Transport handles.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Bus types
pub use bus::{BusEndpoint, Link, Realm};

// Config types
pub use config::{RelayConfig, RelayConfigBuilder};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{CorrelationId, HandleId, SubscriptionId};

// Interceptor types
pub use interceptor::{FallbackAction, Interceptor, Subscription};

// Protocol types
pub use protocol::{
    BusMessage, EventTag, PollEvent, PollEventKind, SendRequest, TransportEvent,
    TransportEventKind, TransportKind,
};

// Relay types
pub use relay::{ExtensionApi, PageRelay};

// Shadow types
pub use shadow::ShadowClient;

// Transport types
pub use transport::{
    EventFanout, HttpPollClient, NativeDuplex, PollClient, PollExchange, ReadyState, SendOutcome,
    Transport, WsDuplex,
};
