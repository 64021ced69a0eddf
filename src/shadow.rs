//! Shadow connection to the backend.
//!
//! The [`ShadowClient`] opens its own engine.io session next to the
//! application's, marked with the shadow query pair so the interceptor never
//! captures it.
//!
//! # Handshake
//!
//! 1. `GET` the polling endpoint; the body's first unit is the open packet
//! 2. Connect the websocket endpoint with the session id
//! 3. Probe: send `2probe`, expect `3probe`, then send `5` (upgrade)
//! 4. Send the socket.io connect packet `40`
//! 5. Ready once the connect acknowledgement `40{"sid":..}` arrives
//!
//! Inbound data frames are forwarded to the bus as internal transport events
//! from step 2 on, ready or not. Server pings are answered with pongs.
//!
//! # Restart
//!
//! [`ShadowClient::restart`] drops readiness and tears the session down
//! before it returns its future; the new session becomes ready only after a
//! fresh acknowledgement.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::bus::BusEndpoint;
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::address::engine_url;
use crate::protocol::frame::{CONNECT, PONG, PROBE_PING, PROBE_PONG, UPGRADE, encode_message};
use crate::protocol::poll::split_units;
use crate::protocol::{BusMessage, Frame, PacketType, TransportEvent, TransportEventKind};
use crate::transport::{DuplexEvent, NativeDuplex, PollClient, WsDuplex};

// ============================================================================
// Types
// ============================================================================

/// A live shadow session.
struct ShadowSession {
    socket: Arc<WsDuplex>,
    reader: JoinHandle<()>,
}

// ============================================================================
// ShadowClient
// ============================================================================

/// Independent duplex connection to the backend.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ShadowClient {
    inner: Arc<ShadowInner>,
}

struct ShadowInner {
    config: RelayConfig,
    bus: BusEndpoint,
    poll_client: Arc<dyn PollClient>,
    ready_tx: watch::Sender<bool>,
    /// Bumped on every teardown and handshake; stale readers check it.
    generation: AtomicU64,
    session: Mutex<Option<ShadowSession>>,
    /// Serialises handshakes.
    handshake_lock: tokio::sync::Mutex<()>,
}

impl ShadowClient {
    /// Creates a client without connecting.
    #[must_use]
    pub fn new(config: RelayConfig, bus: BusEndpoint, poll_client: Arc<dyn PollClient>) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ShadowInner {
                config,
                bus,
                poll_client,
                ready_tx,
                generation: AtomicU64::new(0),
                session: Mutex::new(None),
                handshake_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Creates a client and completes the handshake.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub async fn connect(
        config: RelayConfig,
        bus: BusEndpoint,
        poll_client: Arc<dyn PollClient>,
    ) -> Result<Self> {
        let client = Self::new(config, bus, poll_client);
        client.start().await?;
        Ok(client)
    }

    /// Performs the handshake unless a session already exists.
    ///
    /// If [`restart`](Self::restart) supersedes a handshake that is still
    /// awaiting its acknowledgement, this returns `Ok(())` at once and the
    /// restarted handshake owns readiness from then on.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no backend URL is configured
    /// - [`Error::Handshake`] on any negotiation failure or timeout
    pub async fn start(&self) -> Result<()> {
        let _guard = self.inner.handshake_lock.lock().await;
        if self.inner.session.lock().is_some() {
            debug!("Shadow session already established");
            return Ok(());
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let deadline = self.inner.config.handshake_timeout;

        let result = match timeout(deadline, self.inner.handshake(generation)).await {
            Ok(result) => result,
            Err(_) => Err(Error::handshake(format!(
                "no acknowledgement within {}ms",
                deadline.as_millis()
            ))),
        };

        result.map_err(|e| {
            warn!(error = %e, "Shadow handshake failed");
            self.inner.teardown();
            match e {
                Error::Handshake { .. } | Error::Config { .. } => e,
                other => Error::handshake(other.to_string()),
            }
        })
    }

    /// Tears the session down and re-handshakes.
    ///
    /// Readiness is `false` as soon as this returns; the returned future
    /// completes the new handshake.
    pub fn restart(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        info!("Restarting shadow connection");
        self.inner.teardown();
        let client = self.clone();
        async move { client.start().await }
    }

    /// Closes the session without reconnecting.
    pub fn close(&self) {
        self.inner.teardown();
        debug!("Shadow connection closed");
    }

    /// Returns `true` once the backend acknowledged the session.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.inner.ready_tx.borrow()
    }

    /// Waits until ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShadowNotReady`] if `wait` elapses first.
    pub async fn wait_ready(&self, wait: Duration) -> Result<()> {
        let mut ready_rx = self.inner.ready_tx.subscribe();
        match timeout(wait, ready_rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::ShadowNotReady),
        }
    }

    /// Writes an engine.io message carrying `message`.
    ///
    /// # Errors
    ///
    /// - [`Error::ShadowNotReady`] before the acknowledgement
    /// - [`Error::ConnectionClosed`] if the socket is gone
    pub fn send(&self, message: &str) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::ShadowNotReady);
        }

        let socket = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|session| Arc::clone(&session.socket))
            .ok_or(Error::ShadowNotReady)?;

        socket.transmit(encode_message(message))?;
        self.inner.bus.notify(BusMessage::WebSocketEvent(TransportEvent::internal(
            TransportEventKind::Send,
            message,
        )));
        Ok(())
    }
}

// ============================================================================
// ShadowInner
// ============================================================================

impl ShadowInner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.ready_tx.send_replace(false);

        if let Some(session) = self.session.lock().take() {
            session.reader.abort();
            session.socket.close();
            debug!(handle = %session.socket.id(), "Shadow session torn down");
        }
    }

    async fn handshake(self: &Arc<Self>, generation: u64) -> Result<()> {
        let base = self.config.require_backend()?.clone();
        let path = self.config.socket_path.as_str();
        let marker = (
            self.config.shadow_marker.0.as_str(),
            self.config.shadow_marker.1.as_str(),
        );

        let open_url = engine_url(&base, path, "polling", None, marker)?;
        let body = self.poll_client.get(&open_url).await?;
        let open = match split_units(&body).first().map(|unit| Frame::parse(unit)) {
            Some(Ok(Frame::Open(open))) => open,
            _ => return Err(Error::handshake("backend did not open a session")),
        };
        if !open.upgrades.iter().any(|upgrade| upgrade == "websocket") {
            return Err(Error::handshake("backend offers no websocket upgrade"));
        }
        debug!(sid = %open.sid, "Shadow session opened");

        let socket_url = engine_url(&base, path, "websocket", Some(&open.sid), marker)?;
        let (socket, mut events) = WsDuplex::connect(socket_url.as_str()).await?;

        socket.transmit(PROBE_PING.to_string())?;
        loop {
            match events.recv().await {
                Some(DuplexEvent::Message(text)) if text == PROBE_PONG => break,
                Some(DuplexEvent::Message(text)) => {
                    self.handle_inbound(&socket, generation, &text);
                }
                Some(DuplexEvent::Open) => {}
                Some(DuplexEvent::Close) | None => {
                    return Err(Error::handshake("socket closed during upgrade probe"));
                }
            }
        }
        socket.transmit(UPGRADE.to_string())?;
        socket.transmit(CONNECT.to_string())?;
        trace!(handle = %socket.id(), "Upgrade complete, awaiting acknowledgement");

        let reader = tokio::spawn(Self::run_reader(
            Arc::downgrade(self),
            Arc::clone(&socket),
            generation,
            events,
        ));

        {
            let mut session = self.session.lock();
            if !self.is_current(generation) {
                reader.abort();
                socket.close();
                return Err(Error::handshake("handshake superseded by restart"));
            }
            *session = Some(ShadowSession { socket, reader });
        }

        // A restart bumps the generation and wakes this wait; the newer
        // handshake then owns readiness.
        let mut ready_rx = self.ready_tx.subscribe();
        ready_rx
            .wait_for(|ready| *ready || !self.is_current(generation))
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        if !self.is_current(generation) {
            debug!(generation, "Handshake superseded while awaiting acknowledgement");
        }
        Ok(())
    }

    fn handle_inbound(&self, socket: &WsDuplex, generation: u64, text: &str) {
        match Frame::parse(text) {
            Ok(Frame::SessionAck { sid }) => {
                if self.is_current(generation) {
                    self.ready_tx.send_replace(true);
                    info!(%sid, "Shadow connection ready");
                }
            }

            Ok(Frame::Data(_)) => {
                self.bus.notify(BusMessage::WebSocketEvent(TransportEvent::internal(
                    TransportEventKind::Message,
                    text,
                )));
            }

            Ok(Frame::Control {
                packet: PacketType::Ping,
                ..
            }) => {
                if let Err(e) = socket.transmit(PONG.to_string()) {
                    debug!(error = %e, "Failed to answer ping");
                }
            }

            Ok(Frame::Control {
                packet: PacketType::Close,
                ..
            }) => {
                debug!("Backend closed the shadow session");
                socket.close();
            }

            Ok(_) => {}

            Err(e) => debug!(error = %e, "Dropping malformed shadow frame"),
        }
    }

    /// Shadow socket reader.
    async fn run_reader(
        inner: Weak<Self>,
        socket: Arc<WsDuplex>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<DuplexEvent>,
    ) {
        loop {
            let event = events.recv().await.unwrap_or(DuplexEvent::Close);

            let Some(inner) = inner.upgrade() else {
                break;
            };

            match event {
                DuplexEvent::Open => {}
                DuplexEvent::Message(text) => inner.handle_inbound(&socket, generation, &text),
                DuplexEvent::Close => {
                    if inner.is_current(generation) {
                        inner.ready_tx.send_replace(false);
                        warn!("Shadow connection lost");
                    }
                    break;
                }
            }
        }

        trace!(handle = %socket.id(), "Shadow reader terminated");
    }
}

// ============================================================================
// Tests
// ============================================================================
