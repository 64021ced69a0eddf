//! Page-realm context.
//!
//! [`PageRelay`] replaces per-realm singletons with one explicitly
//! constructed object. `install` starts interception, registers the page
//! handlers and starts the shadow handshake in the background; `teardown`
//! undoes all of it.
//!
//! # Page Handlers
//!
//! | Event | Reply |
//! |-------|-------|
//! | `sendWebSocketMessage` | [`SendOutcome`] |
//! | `isWebSocketCaptured` | `bool` |
//! | `isInternalWebSocketInitialized` | `bool` |
//! | `getActiveWebSocketType` | `"duplex"`, `"poll"` or `null` |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::BusEndpoint;
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::interceptor::{Interceptor, Subscription};
use crate::protocol::{BusMessage, EventTag, SendRequest};
use crate::shadow::ShadowClient;
use crate::transport::{PollClient, SendOutcome};

// ============================================================================
// Constants
// ============================================================================

/// Tags answered by the page realm.
const PAGE_HANDLERS: [EventTag; 4] = [
    EventTag::SendWebSocketMessage,
    EventTag::IsWebSocketCaptured,
    EventTag::IsInternalWebSocketInitialized,
    EventTag::GetActiveWebSocketType,
];

// ============================================================================
// PageRelay
// ============================================================================

/// Page-realm context owning interception and the shadow connection.
pub struct PageRelay {
    config: RelayConfig,
    bus: BusEndpoint,
    interceptor: Interceptor,
    shadow: ShadowClient,
    shadow_task: Mutex<Option<JoinHandle<()>>>,
}

impl PageRelay {
    /// Creates an uninstalled relay.
    #[must_use]
    pub fn new(config: RelayConfig, bus: BusEndpoint, poll_client: Arc<dyn PollClient>) -> Self {
        let interceptor = Interceptor::new(config.clone(), bus.clone(), Arc::clone(&poll_client));
        let shadow = ShadowClient::new(config.clone(), bus.clone(), poll_client);
        Self {
            config,
            bus,
            interceptor,
            shadow,
            shadow_task: Mutex::new(None),
        }
    }

    /// Starts interception for `page_url` and registers the page handlers.
    ///
    /// The shadow handshake runs in the background when a backend URL is
    /// configured; its failure only leaves the shadow connection not ready.
    pub fn install(&self, page_url: &str) {
        self.interceptor.start(page_url);
        self.register_handlers();

        if self.config.backend_url.is_some() {
            let shadow = self.shadow.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = shadow.start().await {
                    warn!(error = %e, "Shadow connection unavailable");
                }
            });
            if let Some(previous) = self.shadow_task.lock().replace(task) {
                previous.abort();
            }
        } else {
            debug!("No backend configured, shadow connection disabled");
        }

        info!(%page_url, "Page relay installed");
    }

    /// Stops interception, closes the shadow connection and shuts the bus
    /// endpoint down. In-flight calls fail with `ConnectionClosed`.
    pub fn teardown(&self) {
        self.interceptor.shutdown();
        if let Some(task) = self.shadow_task.lock().take() {
            task.abort();
        }
        self.shadow.close();

        for tag in PAGE_HANDLERS {
            self.bus.remove_handler(tag);
        }
        self.bus.shutdown();
        info!("Page relay torn down");
    }

    /// Returns the interceptor.
    #[inline]
    #[must_use]
    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    /// Returns the shadow client.
    #[inline]
    #[must_use]
    pub fn shadow(&self) -> &ShadowClient {
        &self.shadow
    }

    /// Returns the page bus endpoint.
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &BusEndpoint {
        &self.bus
    }

    /// Subscribes to inbound units of the active transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveTransport`] if nothing is captured.
    pub fn subscribe_to_transport<S, T, C>(
        &self,
        start: S,
        stop: T,
        callback: C,
    ) -> Result<Subscription>
    where
        S: Fn(&str) -> bool + Send + Sync + 'static,
        T: Fn(&str) -> bool + Send + Sync + 'static,
        C: Fn(&str) + Send + Sync + 'static,
    {
        self.interceptor.subscribe(start, stop, callback)
    }

    fn register_handlers(&self) {
        let interceptor = self.interceptor.clone();
        let shadow = self.shadow.clone();
        self.bus
            .on_receive(EventTag::SendWebSocketMessage, move |message| {
                let interceptor = interceptor.clone();
                let shadow = shadow.clone();
                async move {
                    let BusMessage::SendWebSocketMessage(request) = message else {
                        return Err(Error::protocol("expected a send request"));
                    };
                    let outcome = route_send(&interceptor, &shadow, request).await?;
                    Ok(Some(serde_json::to_value(outcome)?))
                }
            });

        let interceptor = self.interceptor.clone();
        self.bus.on_receive(EventTag::IsWebSocketCaptured, move |_| {
            let captured = interceptor.is_captured();
            async move { Ok(Some(Value::Bool(captured))) }
        });

        let shadow = self.shadow.clone();
        self.bus
            .on_receive(EventTag::IsInternalWebSocketInitialized, move |_| {
                let ready = shadow.is_ready();
                async move { Ok(Some(Value::Bool(ready))) }
            });

        let interceptor = self.interceptor.clone();
        self.bus.on_receive(EventTag::GetActiveWebSocketType, move |_| {
            let kind = interceptor.active_kind();
            async move {
                serde_json::to_value(kind)
                    .map(Some)
                    .map_err(Error::from)
            }
        });
    }
}

/// Sends through the shadow connection when it is ready, else through the
/// active captured transport.
async fn route_send(
    interceptor: &Interceptor,
    shadow: &ShadowClient,
    request: SendRequest,
) -> Result<SendOutcome> {
    if !request.prefer_poll && shadow.is_ready() {
        let payload = request
            .payload
            .strip_prefix('4')
            .unwrap_or(&request.payload);
        match shadow.send(payload) {
            Ok(()) => return Ok(SendOutcome::Shadow),
            Err(e) => debug!(error = %e, "Shadow send failed, using captured transport"),
        }
    }

    interceptor
        .send_through_active(request.payload, request.prefer_poll)
        .await
}

// ============================================================================
// Tests
// ============================================================================
