//! Extension-realm capability surface.
//!
//! [`ExtensionApi`] wraps the extension's bus endpoint with typed calls to
//! the page realm and typed registration of the transport observers.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use crate::bus::BusEndpoint;
use crate::error::{Error, Result};
use crate::protocol::{BusMessage, EventTag, PollEvent, SendRequest, TransportEvent, TransportKind};
use crate::transport::SendOutcome;

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for calls into the page realm.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ExtensionApi
// ============================================================================

/// Typed access to the page realm from the extension realm.
#[derive(Clone)]
pub struct ExtensionApi {
    bus: BusEndpoint,
    query_timeout: Duration,
}

impl ExtensionApi {
    /// Wraps the extension's bus endpoint.
    #[must_use]
    pub fn new(bus: BusEndpoint) -> Self {
        Self {
            bus,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Sets the timeout for calls into the page realm.
    #[must_use]
    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    /// Returns the underlying endpoint.
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &BusEndpoint {
        &self.bus
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Sends a frame through whichever transport the page has active.
    ///
    /// # Errors
    ///
    /// - [`Error::NoActiveTransport`] if the page has nothing captured
    /// - [`Error::Remote`] for other page-side failures
    /// - [`Error::RequestTimeout`] if the page does not answer
    pub async fn send_websocket_message(
        &self,
        payload: impl Into<String>,
        prefer_poll: bool,
    ) -> Result<SendOutcome> {
        let request = BusMessage::SendWebSocketMessage(SendRequest {
            payload: payload.into(),
            prefer_poll,
        });

        self.bus
            .request::<SendOutcome>(request, Some(self.query_timeout))
            .await
            .map_err(restore_local_error)?
            .ok_or_else(|| Error::protocol("empty reply to sendWebSocketMessage"))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns `true` if the page has a transport to send through.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestTimeout`] if the page does not answer.
    pub async fn is_active_transport_captured(&self) -> Result<bool> {
        self.query_bool(BusMessage::IsWebSocketCaptured).await
    }

    /// Returns the kind of the page's active transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestTimeout`] if the page does not answer.
    pub async fn active_transport_kind(&self) -> Result<Option<TransportKind>> {
        self.bus
            .request(BusMessage::GetActiveWebSocketType, Some(self.query_timeout))
            .await
    }

    /// Returns `true` once the page's shadow connection is ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestTimeout`] if the page does not answer.
    pub async fn is_shadow_ready(&self) -> Result<bool> {
        self.query_bool(BusMessage::IsInternalWebSocketInitialized)
            .await
    }

    async fn query_bool(&self, message: BusMessage) -> Result<bool> {
        let answer = self
            .bus
            .request::<bool>(message, Some(self.query_timeout))
            .await?;
        Ok(answer.unwrap_or(false))
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Observes duplex transport events.
    ///
    /// For `send` events the returned text is what gets written; `None`
    /// suppresses the frame. The return value of other events is ignored.
    pub fn on_transport_event<F, Fut>(&self, handler: F)
    where
        F: Fn(TransportEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        self.bus.on_receive(EventTag::WebSocketEvent, move |message| {
            let reply = match message {
                BusMessage::WebSocketEvent(event) => Some(handler(event)),
                _ => None,
            };
            async move {
                match reply {
                    Some(reply) => Ok(reply.await?.map(Value::String)),
                    None => Err(Error::protocol("expected a transport event")),
                }
            }
        });
    }

    /// Observes long-poll units.
    ///
    /// For `request` units the returned text replaces the unit; `None`
    /// keeps it unchanged.
    pub fn on_poll_event<F, Fut>(&self, handler: F)
    where
        F: Fn(PollEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        self.bus.on_receive(EventTag::LongPollingEvent, move |message| {
            let reply = match message {
                BusMessage::LongPollingEvent(event) => Some(handler(event)),
                _ => None,
            };
            async move {
                match reply {
                    Some(reply) => Ok(reply.await?.map(Value::String)),
                    None => Err(Error::protocol("expected a poll event")),
                }
            }
        });
    }
}

/// Maps page-side failures that have a local meaning back to their variant.
fn restore_local_error(error: Error) -> Error {
    match error {
        Error::Remote { ref message } if *message == Error::NoActiveTransport.to_string() => {
            Error::NoActiveTransport
        }
        other => other,
    }
}

// ============================================================================
// Tests
// ============================================================================
