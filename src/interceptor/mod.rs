//! Transport interception and fallback.
//!
//! The [`Interceptor`] lives in the page realm next to the application. It
//! never opens or closes the application's transports; the host feeds it
//! three kinds of observation:
//!
//! | Observation | Entry point |
//! |-------------|-------------|
//! | A duplex socket is about to transmit | [`Interceptor::observe_outbound`] |
//! | A long-poll request is about to be sent | [`Interceptor::on_poll_request`] |
//! | A long-poll request completed | [`Interceptor::on_poll_complete`] |
//!
//! # Capture
//!
//! The first outbound frame of an open socket that is neither registered nor
//! marked as the shadow connection captures it: the socket is wrapped in a
//! [`CapturedDuplex`], its events are forwarded over the bus, and it becomes
//! the active handle. The registry check and insert happen under one lock.
//!
//! # Fallback
//!
//! Poll instrumentation arms at [`start`](Interceptor::start) unless the page
//! address carries the deferred-poll parameter. In that case a timer arms it
//! after the grace period, unless a duplex socket was captured first; capture
//! aborts the timer.
//!
//! # Active handle
//!
//! The most recently captured duplex that is still open, else the most
//! recent polling handle, else none. Every open captured socket stays
//! wrapped until it closes, whether or not it is the active one.

// ============================================================================
// Submodules
// ============================================================================

/// Inbound unit subscriptions.
pub mod subscription;

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bus::BusEndpoint;
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::identifiers::HandleId;
use crate::protocol::address::{has_query_param, has_session_id, is_polling_url, to_polling_url};
use crate::protocol::poll::{join_units, split_units};
use crate::protocol::{
    BusMessage, PollEvent, PollEventKind, TransportEvent, TransportEventKind, TransportKind,
};
use crate::transport::poll::one_shot_exchange;
use crate::transport::{
    CapturedDuplex, DuplexEvent, NativeDuplex, PollClient, PollExchange, PollHandle, PollState,
    ReadyState, SendOutcome, Transport,
};

use subscription::{SubscriptionRegistry, UnitSource};

// ============================================================================
// Re-exports
// ============================================================================

pub use subscription::{Subscription, UnitCallback, UnitFilter};

// ============================================================================
// Types
// ============================================================================

/// Invoked once when the poll fallback fires.
pub type FallbackAction = Arc<dyn Fn() + Send + Sync>;

/// Mutable capture state, always mutated under one lock.
#[derive(Default)]
struct CaptureState {
    started: bool,
    poll_armed: bool,
    /// Every socket ever captured. Entries are never removed.
    registry: FxHashMap<HandleId, Weak<CapturedDuplex>>,
    /// Captured sockets not yet seen closing, oldest first. Owns the
    /// wrappers the registry points at.
    open: Vec<Arc<CapturedDuplex>>,
    poll: Option<Arc<PollHandle>>,
    fallback_timer: Option<JoinHandle<()>>,
}

impl CaptureState {
    fn open_duplex(&self) -> Option<Arc<CapturedDuplex>> {
        self.open.iter().rev().find(|duplex| duplex.is_open()).cloned()
    }
}

/// Routing decision for an observed outbound frame.
enum Route {
    /// Not ours to touch.
    Passthrough,
    /// First frame of a newly captured socket.
    Captured(Arc<CapturedDuplex>, mpsc::UnboundedReceiver<DuplexEvent>),
    /// Socket already captured; go through the wrapper.
    Wrapped(Arc<CapturedDuplex>),
}

// ============================================================================
// Interceptor
// ============================================================================

/// Page-realm transport interceptor.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Interceptor {
    inner: Arc<InterceptorInner>,
}

struct InterceptorInner {
    config: RelayConfig,
    bus: BusEndpoint,
    poll_client: Arc<dyn PollClient>,
    state: Mutex<CaptureState>,
    subscriptions: Arc<SubscriptionRegistry>,
    fallback_action: Mutex<Option<FallbackAction>>,
}

impl Interceptor {
    /// Creates an idle interceptor. Nothing is observed until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(config: RelayConfig, bus: BusEndpoint, poll_client: Arc<dyn PollClient>) -> Self {
        Self {
            inner: Arc::new(InterceptorInner {
                config,
                bus,
                poll_client,
                state: Mutex::new(CaptureState::default()),
                subscriptions: Arc::new(SubscriptionRegistry::default()),
                fallback_action: Mutex::new(None),
            }),
        }
    }

    /// Sets the action run when the poll fallback fires.
    pub fn set_fallback_action<F>(&self, action: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.fallback_action.lock() = Some(Arc::new(action));
    }

    /// Starts observing.
    ///
    /// Arms poll instrumentation now, or after the grace period when
    /// `page_url` carries the deferred-poll parameter. Must be called inside
    /// a tokio runtime.
    pub fn start(&self, page_url: &str) {
        let mut state = self.inner.state.lock();
        if state.started {
            debug!("Interceptor already started");
            return;
        }
        state.started = true;

        if has_query_param(page_url, &self.inner.config.deferred_poll_param) {
            let grace = self.inner.config.fallback_grace;
            let weak = Arc::downgrade(&self.inner);
            state.fallback_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(inner) = weak.upgrade() {
                    inner.fire_fallback();
                }
            }));
            debug!(grace_ms = grace.as_millis() as u64, "Poll instrumentation deferred");
        } else {
            state.poll_armed = true;
            info!("Poll instrumentation armed");
        }
    }

    /// Stops observing; pending fallback and subscriptions are dropped.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.fallback_timer.take() {
            timer.abort();
        }
        state.started = false;
        state.poll_armed = false;
        drop(state);

        self.inner.subscriptions.clear();
        debug!("Interceptor shut down");
    }

    // ========================================================================
    // Duplex Observation
    // ========================================================================

    /// Routes an outbound frame the application is sending on `native`.
    ///
    /// The frame that captures a socket is written unchanged and reported as
    /// a `send` event; later frames on a captured socket go through the
    /// rewriting wrapper.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the socket cannot be written.
    pub async fn observe_outbound(
        &self,
        native: Arc<dyn NativeDuplex>,
        data: String,
    ) -> Result<SendOutcome> {
        match self.route(&native) {
            Route::Passthrough => {
                native.transmit(data)?;
                Ok(SendOutcome::Transmitted)
            }

            Route::Captured(captured, events) => {
                let id = captured.id();
                info!(handle = %id, url = %native.url(), "Duplex transport captured");
                tokio::spawn(InterceptorInner::run_forwarder(
                    Arc::downgrade(&self.inner),
                    id,
                    events,
                ));
                captured.transmit_direct(data)?;
                Ok(SendOutcome::Transmitted)
            }

            Route::Wrapped(captured) => captured.send(data).await,
        }
    }

    fn route(&self, native: &Arc<dyn NativeDuplex>) -> Route {
        let mut state = self.inner.state.lock();
        let id = native.id();

        if !state.started || self.inner.config.is_shadow_url(native.url()) {
            return Route::Passthrough;
        }

        if let Some(entry) = state.registry.get(&id) {
            return match entry.upgrade() {
                Some(captured) => Route::Wrapped(captured),
                None => Route::Passthrough,
            };
        }

        if native.ready_state() != ReadyState::Open {
            trace!(handle = %id, "Socket not open, capture skipped");
            return Route::Passthrough;
        }

        let captured = Arc::new(CapturedDuplex::new(
            Arc::clone(native),
            self.inner.bus.clone(),
            self.inner.config.send_rewrite_timeout,
        ));
        let events = native.events();

        state.registry.insert(id, Arc::downgrade(&captured));
        state.open.push(Arc::clone(&captured));
        if let Some(timer) = state.fallback_timer.take() {
            timer.abort();
            debug!("Poll fallback cancelled by capture");
        }

        Route::Captured(captured, events)
    }

    // ========================================================================
    // Poll Observation
    // ========================================================================

    /// Offers each unit of an outbound poll body for rewriting.
    ///
    /// Returns the body to actually send: the rewritten units re-joined, or
    /// the original body if instrumentation is off or any rewrite call fails.
    pub async fn on_poll_request(&self, url: &str, body: String) -> String {
        if !self.inner.state.lock().poll_armed || !is_polling_url(url) {
            return body;
        }

        let units: Vec<String> = split_units(&body).into_iter().map(str::to_owned).collect();
        if units.is_empty() {
            return body;
        }

        let timeout = self.inner.config.poll_rewrite_timeout;
        let mut rewritten = Vec::with_capacity(units.len());
        for unit in units {
            let request = BusMessage::LongPollingEvent(PollEvent {
                event: PollEventKind::Request,
                payload: unit.clone(),
            });

            match self.inner.bus.send(request, Some(timeout)).await {
                Ok(Some(Value::String(text))) => rewritten.push(text),
                Ok(None | Some(Value::Null)) => rewritten.push(unit),
                Ok(Some(other)) => rewritten.push(other.to_string()),
                Err(e) => {
                    debug!(error = %e, "Poll rewrite failed, sending original body");
                    return body;
                }
            }
        }

        join_units(&rewritten)
    }

    /// Records a completed poll exchange.
    ///
    /// A polling response becomes the active poll handle and its units are
    /// forwarded in arrival order.
    pub fn on_poll_complete(&self, exchange: PollExchange) {
        if exchange.state != PollState::Done || !is_polling_url(&exchange.response_url) {
            return;
        }

        {
            let mut state = self.inner.state.lock();
            if !state.poll_armed {
                return;
            }
            state.poll = Some(Arc::new(PollHandle::new(
                exchange.response_url.clone(),
                self.inner.bus.clone(),
                Arc::clone(&self.inner.poll_client),
                self.inner.config.poll_rewrite_timeout,
            )));
        }

        let units = split_units(&exchange.response_body);
        trace!(units = units.len(), "Poll response received");
        for unit in units {
            self.inner.bus.notify(BusMessage::LongPollingEvent(PollEvent {
                event: PollEventKind::Response,
                payload: unit.to_string(),
            }));
            self.inner.subscriptions.dispatch(UnitSource::Poll, unit);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns the handle frames are currently sent through.
    #[must_use]
    pub fn active_handle(&self) -> Option<Arc<dyn Transport>> {
        let state = self.inner.state.lock();
        if let Some(duplex) = state.open_duplex() {
            return Some(duplex as Arc<dyn Transport>);
        }
        state.poll.clone().map(|poll| poll as Arc<dyn Transport>)
    }

    /// Returns the kind of the active handle.
    #[must_use]
    pub fn active_kind(&self) -> Option<TransportKind> {
        self.active_handle().map(|handle| handle.kind())
    }

    /// Returns the instrumentation state: `Duplex` while a captured socket is
    /// open, else `Poll` once poll instrumentation is armed.
    #[must_use]
    pub fn observed_kind(&self) -> Option<TransportKind> {
        let state = self.inner.state.lock();
        if state.open_duplex().is_some() {
            Some(TransportKind::Duplex)
        } else if state.poll_armed {
            Some(TransportKind::Poll)
        } else {
            None
        }
    }

    /// Returns `true` if any transport is available to send through.
    #[must_use]
    pub fn is_captured(&self) -> bool {
        self.active_handle().is_some()
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Sends a frame through the active handle.
    ///
    /// With `prefer_poll`, an active duplex whose address carries a session
    /// id is bypassed in favour of a one-shot poll exchange against the
    /// polling variant of that address.
    ///
    /// # Errors
    ///
    /// - [`Error::NoActiveTransport`] if nothing is captured
    /// - [`Error::ConnectionClosed`] if the socket write fails
    /// - [`Error::Http`] / [`Error::Connection`] if a poll exchange fails
    pub async fn send_through_active(&self, data: String, prefer_poll: bool) -> Result<SendOutcome> {
        let (duplex, poll) = {
            let state = self.inner.state.lock();
            (state.open_duplex(), state.poll.clone())
        };

        if let Some(duplex) = duplex {
            let url = duplex.url();
            if prefer_poll && has_session_id(&url) {
                let polling = to_polling_url(&url)?;
                debug!(handle = %duplex.id(), url = %polling, "Sending through one-shot poll exchange");
                let response = one_shot_exchange(
                    &self.inner.bus,
                    self.inner.poll_client.as_ref(),
                    &polling,
                    data,
                    self.inner.config.poll_rewrite_timeout,
                )
                .await?;
                return Ok(SendOutcome::Polled { response });
            }

            duplex.transmit_direct(data)?;
            return Ok(SendOutcome::Transmitted);
        }

        if let Some(poll) = poll {
            return poll.send(data).await;
        }

        warn!("No active transport to send through");
        Err(Error::NoActiveTransport)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribes to inbound units of the active handle.
    ///
    /// Every unit passing `start` reaches `callback`; the first unit passing
    /// `stop` ends the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveTransport`] if nothing is captured.
    pub fn subscribe<S, T, C>(&self, start: S, stop: T, callback: C) -> Result<Subscription>
    where
        S: Fn(&str) -> bool + Send + Sync + 'static,
        T: Fn(&str) -> bool + Send + Sync + 'static,
        C: Fn(&str) + Send + Sync + 'static,
    {
        let source = {
            let state = self.inner.state.lock();
            match (state.open_duplex(), &state.poll) {
                (Some(duplex), _) => UnitSource::Duplex(duplex.id()),
                (None, Some(_)) => UnitSource::Poll,
                (None, None) => return Err(Error::NoActiveTransport),
            }
        };

        Ok(self.inner.subscriptions.register(
            source,
            Box::new(start),
            Box::new(stop),
            Box::new(callback),
        ))
    }

    /// Number of live subscriptions.
    #[inline]
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    #[cfg(test)]
    fn registry_len(&self) -> usize {
        self.inner.state.lock().registry.len()
    }
}

// ============================================================================
// InterceptorInner
// ============================================================================

impl InterceptorInner {
    fn fire_fallback(&self) {
        let fire = {
            let mut state = self.state.lock();
            state.fallback_timer = None;
            if !state.started || state.poll_armed || state.open_duplex().is_some() {
                false
            } else {
                state.poll_armed = true;
                true
            }
        };

        if !fire {
            return;
        }

        info!("No duplex transport observed, falling back to polling");
        let action = self.fallback_action.lock().clone();
        if let Some(action) = action {
            action();
        }
    }

    fn forward(&self, event: TransportEventKind, payload: &str) {
        self.bus.notify(BusMessage::WebSocketEvent(TransportEvent::captured(
            event,
            TransportKind::Duplex,
            payload,
        )));
    }

    fn release_duplex(&self, id: HandleId) {
        let mut state = self.state.lock();
        state.open.retain(|duplex| duplex.id() != id);
        match state.open_duplex() {
            Some(next) => info!(handle = %id, active = %next.id(), "Duplex transport closed"),
            None => info!(handle = %id, "Duplex transport closed, capture re-armed"),
        }
    }

    /// Forwards a captured socket's events until it closes.
    async fn run_forwarder(
        inner: Weak<Self>,
        id: HandleId,
        mut events: mpsc::UnboundedReceiver<DuplexEvent>,
    ) {
        loop {
            let event = events.recv().await.unwrap_or(DuplexEvent::Close);

            let Some(inner) = inner.upgrade() else {
                break;
            };

            match event {
                DuplexEvent::Open => inner.forward(TransportEventKind::Open, ""),

                DuplexEvent::Message(text) => {
                    inner.forward(TransportEventKind::Message, &text);
                    inner.subscriptions.dispatch(UnitSource::Duplex(id), &text);
                }

                DuplexEvent::Close => {
                    inner.forward(TransportEventKind::Close, "closed");
                    inner.release_duplex(id);
                    break;
                }
            }
        }

        debug!(handle = %id, "Forwarder terminated");
    }
}

// ============================================================================
// Tests
// ============================================================================
