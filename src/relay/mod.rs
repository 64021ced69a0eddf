//! Realm-level entry points.
//!
//! | Type | Realm | Role |
//! |------|-------|------|
//! | [`PageRelay`] | page | Owns the interceptor and shadow client; answers bus queries |
//! | [`ExtensionApi`] | extension | Typed capability surface over the bus |
//!
//! # Example
//!
//! ```ignore
//! use realm_relay::{ExtensionApi, HttpPollClient, PageRelay, Realm, RelayConfig, bus};
//! use std::sync::Arc;
//!
//! let config = RelayConfig::builder()
//!     .backend_url("https://chat.example.com")
//!     .build()?;
//! let (page, extension) = bus::pair_with_config(Realm::Page, Realm::Extension, &config);
//!
//! let relay = PageRelay::new(config, page, Arc::new(HttpPollClient::new()?));
//! relay.install("https://chat.example.com/c/123");
//!
//! let api = ExtensionApi::new(extension);
//! api.on_transport_event(|event| async move { Ok(Some(event.payload)) });
//! let outcome = api.send_websocket_message("42[\"hello\"]", false).await?;
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Extension-realm capability surface.
pub mod extension;

/// Page-realm context.
pub mod page;

// ============================================================================
// Re-exports
// ============================================================================

pub use extension::ExtensionApi;
pub use page::PageRelay;
