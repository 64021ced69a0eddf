//! Bus endpoint and event loop.
//!
//! An endpoint spawns a tokio task that handles:
//!
//! - Outgoing calls (correlation registered before the envelope leaves)
//! - Outgoing notifications (no correlation entry, never answered)
//! - Incoming replies (resolve or discard when the id was retired)
//! - Incoming calls (routed to one FIFO worker per event tag)

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::CorrelationId;
use crate::protocol::envelope::UNHANDLED_PREFIX;
use crate::protocol::{BusMessage, Envelope, EventTag, Reply, WireMessage};

use super::{Link, Realm};

// ============================================================================
// Constants
// ============================================================================

/// Maximum in-flight calls before rejecting new ones.
const DEFAULT_MAX_PENDING: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// Future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, Result<Option<Value>>>;

/// Handler for one event tag.
///
/// The returned value (or error) resolves the remote caller's call.
pub type Handler = Arc<dyn Fn(BusMessage) -> HandlerFuture + Send + Sync>;

/// Map of correlation ids to pending resolvers.
type CorrelationMap = FxHashMap<CorrelationId, oneshot::Sender<Result<Option<Value>>>>;

/// Handler table, one entry per tag.
type HandlerMap = FxHashMap<EventTag, Handler>;

// ============================================================================
// EndpointCommand
// ============================================================================

/// Internal commands for the event loop.
enum EndpointCommand {
    /// Register a resolver and emit the envelope.
    Call {
        envelope: Envelope,
        response_tx: oneshot::Sender<Result<Option<Value>>>,
    },
    /// Emit a notification; nothing is registered.
    Notify(Envelope),
    /// Emit a handler's reply.
    Reply(Reply),
    /// Retire a timed-out correlation id.
    RemoveCorrelation(CorrelationId),
    /// Stop the loop.
    Shutdown,
}

// ============================================================================
// BusEndpoint
// ============================================================================

/// One realm's end of the bus.
///
/// Cheap to clone; clones share the correlation and handler tables.
#[derive(Clone)]
pub struct BusEndpoint {
    realm: Realm,
    command_tx: mpsc::UnboundedSender<EndpointCommand>,
    correlation: Arc<Mutex<CorrelationMap>>,
    handlers: Arc<Mutex<HandlerMap>>,
    max_pending: usize,
}

impl BusEndpoint {
    /// Creates an endpoint over a link and spawns its event loop.
    #[must_use]
    pub fn new(realm: Realm, link: Link) -> Self {
        Self::with_max_pending(realm, link, DEFAULT_MAX_PENDING)
    }

    /// Creates an endpoint with a custom in-flight call limit.
    #[must_use]
    pub fn with_max_pending(realm: Realm, link: Link, max_pending: usize) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));
        let handlers = Arc::new(Mutex::new(HandlerMap::default()));

        tokio::spawn(Self::run_event_loop(
            realm,
            link,
            command_rx,
            command_tx.clone(),
            Arc::clone(&correlation),
            Arc::clone(&handlers),
        ));

        Self {
            realm,
            command_tx,
            correlation,
            handlers,
            max_pending,
        }
    }

    /// Returns the realm this endpoint lives in.
    #[inline]
    #[must_use]
    pub fn realm(&self) -> Realm {
        self.realm
    }

    /// Returns the in-flight call limit.
    #[inline]
    #[must_use]
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Registers the handler for `tag`, replacing any earlier one.
    pub fn on_receive<F, Fut>(&self, tag: EventTag, handler: F)
    where
        F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |message| handler(message).boxed());
        if self.handlers.lock().insert(tag, handler).is_some() {
            debug!(realm = %self.realm, event = %tag, "Replaced bus handler");
        }
    }

    /// Removes the handler for `tag`.
    pub fn remove_handler(&self, tag: EventTag) {
        self.handlers.lock().remove(&tag);
    }

    /// Sends a call and waits for the peer realm's reply.
    ///
    /// With `call_timeout` set, a missing handler fails the call with
    /// [`Error::UnhandledEvent`]; without it, a missing handler resolves the
    /// call with `None`.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] if no reply arrives within `call_timeout`
    /// - [`Error::UnhandledEvent`] if the peer has no handler (timeout set)
    /// - [`Error::Remote`] if the peer handler failed
    /// - [`Error::Protocol`] if too many calls are pending
    /// - [`Error::ConnectionClosed`] if the endpoint shut down
    pub async fn send(
        &self,
        message: BusMessage,
        call_timeout: Option<Duration>,
    ) -> Result<Option<Value>> {
        {
            let correlation = self.correlation.lock();
            if correlation.len() >= self.max_pending {
                warn!(
                    pending = correlation.len(),
                    max = self.max_pending,
                    "Too many pending calls"
                );
                return Err(Error::protocol(format!(
                    "Too many pending calls: {}/{}",
                    correlation.len(),
                    self.max_pending
                )));
            }
        }

        let correlation_id = CorrelationId::generate();
        let timeout_ms = call_timeout.map(timeout_millis);
        let envelope = Envelope::new(&message, correlation_id, timeout_ms)?;

        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(EndpointCommand::Call {
                envelope,
                response_tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        let Some(call_timeout) = call_timeout else {
            return response_rx.await.map_err(|_| Error::ConnectionClosed)?;
        };

        match timeout(call_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                let _ = self
                    .command_tx
                    .send(EndpointCommand::RemoveCorrelation(correlation_id));

                Err(Error::request_timeout(correlation_id, timeout_ms.unwrap_or_default()))
            }
        }
    }

    /// Sends a call and deserializes the reply.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send), plus [`Error::Json`] if the reply does
    /// not match `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        message: BusMessage,
        call_timeout: Option<Duration>,
    ) -> Result<Option<T>> {
        match self.send(message, call_timeout).await? {
            Some(Value::Null) | None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    /// Sends a call the peer runs but never answers.
    ///
    /// Notifications are emitted in the order they are issued, interleaved
    /// with calls, and do not count against the pending-call limit.
    pub fn notify(&self, message: BusMessage) {
        let envelope = match Envelope::notification(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, event = %message.tag(), "Failed to encode notification");
                return;
            }
        };

        if self.command_tx.send(EndpointCommand::Notify(envelope)).is_err() {
            debug!(realm = %self.realm, "Notification dropped, endpoint closed");
        }
    }

    /// Returns the number of pending calls.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlation.lock().len()
    }

    /// Shuts the endpoint down; pending calls fail with `ConnectionClosed`.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(EndpointCommand::Shutdown);
    }

    /// Event loop owning the link.
    async fn run_event_loop(
        realm: Realm,
        mut link: Link,
        mut command_rx: mpsc::UnboundedReceiver<EndpointCommand>,
        command_tx: mpsc::UnboundedSender<EndpointCommand>,
        correlation: Arc<Mutex<CorrelationMap>>,
        handlers: Arc<Mutex<HandlerMap>>,
    ) {
        let mut workers: FxHashMap<EventTag, mpsc::UnboundedSender<Envelope>> =
            FxHashMap::default();

        loop {
            tokio::select! {
                frame = link.inbound.recv() => {
                    let Some(text) = frame else {
                        debug!(%realm, "Peer realm link closed");
                        break;
                    };

                    match WireMessage::decode(&text) {
                        Ok(WireMessage::Reply(reply)) => {
                            Self::handle_reply(realm, reply, &correlation);
                        }
                        Ok(WireMessage::Call(envelope)) => {
                            Self::route_call(
                                realm,
                                envelope,
                                &mut workers,
                                &command_tx,
                                &handlers,
                            );
                        }
                        Err(e) => {
                            warn!(%realm, error = %e, "Dropping malformed bus frame");
                        }
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(EndpointCommand::Call { envelope, response_tx }) => {
                            Self::handle_call_command(realm, envelope, response_tx, &link, &correlation);
                        }

                        Some(EndpointCommand::Notify(envelope)) => {
                            Self::emit(realm, &link, &WireMessage::Call(envelope));
                        }

                        Some(EndpointCommand::Reply(reply)) => {
                            Self::emit(realm, &link, &WireMessage::Reply(reply));
                        }

                        Some(EndpointCommand::RemoveCorrelation(correlation_id)) => {
                            correlation.lock().remove(&correlation_id);
                            debug!(%realm, %correlation_id, "Retired timed-out call");
                        }

                        Some(EndpointCommand::Shutdown) | None => {
                            debug!(%realm, "Bus endpoint shutting down");
                            break;
                        }
                    }
                }
            }
        }

        Self::fail_pending_calls(realm, &correlation);
        debug!(%realm, "Bus event loop terminated");
    }

    /// Registers the resolver, then emits the envelope.
    fn handle_call_command(
        realm: Realm,
        envelope: Envelope,
        response_tx: oneshot::Sender<Result<Option<Value>>>,
        link: &Link,
        correlation: &Arc<Mutex<CorrelationMap>>,
    ) {
        let correlation_id = envelope.correlation_id;
        let event = envelope.event.clone();

        correlation.lock().insert(correlation_id, response_tx);

        if !Self::emit(realm, link, &WireMessage::Call(envelope))
            && let Some(tx) = correlation.lock().remove(&correlation_id)
        {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        trace!(%realm, %correlation_id, %event, "Call sent");
    }

    /// Resolves the pending call for a reply.
    fn handle_reply(realm: Realm, reply: Reply, correlation: &Arc<Mutex<CorrelationMap>>) {
        let correlation_id = reply.correlation_id;
        let tx = correlation.lock().remove(&correlation_id);

        match tx {
            Some(tx) => {
                let _ = tx.send(reply.into_result());
            }
            None => {
                debug!(%realm, %correlation_id, "Discarding reply for retired call");
            }
        }
    }

    /// Hands a call to its tag's FIFO worker.
    fn route_call(
        realm: Realm,
        envelope: Envelope,
        workers: &mut FxHashMap<EventTag, mpsc::UnboundedSender<Envelope>>,
        command_tx: &mpsc::UnboundedSender<EndpointCommand>,
        handlers: &Arc<Mutex<HandlerMap>>,
    ) {
        let Some(tag) = EventTag::parse(&envelope.event) else {
            if envelope.no_reply {
                debug!(%realm, event = %envelope.event, "Dropping notification with unknown tag");
            } else {
                let reply = Self::unhandled_reply(&envelope);
                let _ = command_tx.send(EndpointCommand::Reply(reply));
            }
            return;
        };

        let worker = workers.entry(tag).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(Self::run_tag_worker(
                realm,
                tag,
                rx,
                command_tx.clone(),
                Arc::clone(handlers),
            ));
            tx
        });

        if worker.send(envelope).is_err() {
            warn!(%realm, event = %tag, "Tag worker stopped");
        }
    }

    /// Runs handlers for one tag strictly in arrival order.
    async fn run_tag_worker(
        realm: Realm,
        tag: EventTag,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
        command_tx: mpsc::UnboundedSender<EndpointCommand>,
        handlers: Arc<Mutex<HandlerMap>>,
    ) {
        while let Some(envelope) = rx.recv().await {
            let handler = handlers.lock().get(&tag).cloned();
            let correlation_id = envelope.correlation_id;
            let no_reply = envelope.no_reply;

            let reply = match handler {
                None => Self::unhandled_reply(&envelope),
                Some(handler) => match envelope.message() {
                    Ok(message) => match handler(message).await {
                        Ok(result) => Reply::success(correlation_id, result),
                        Err(e) => {
                            debug!(%realm, event = %tag, error = %e, "Handler failed");
                            Reply::failure(correlation_id, e.to_string())
                        }
                    },
                    Err(e) => {
                        warn!(%realm, event = %tag, error = %e, "Rejected payload");
                        Reply::failure(correlation_id, e.to_string())
                    }
                },
            };

            if no_reply {
                continue;
            }
            if command_tx.send(EndpointCommand::Reply(reply)).is_err() {
                break;
            }
        }
    }

    /// Reply for a call nobody handles.
    ///
    /// Callers without a timeout get the absence value instead of an error.
    fn unhandled_reply(envelope: &Envelope) -> Reply {
        match envelope.timeout_ms {
            Some(_) => Reply::failure(
                envelope.correlation_id,
                format!("{UNHANDLED_PREFIX}{}", envelope.event),
            ),
            None => Reply::success(envelope.correlation_id, None),
        }
    }

    /// Writes one frame to the peer; returns `false` if the link is gone.
    fn emit(realm: Realm, link: &Link, message: &WireMessage) -> bool {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(%realm, error = %e, "Failed to encode bus frame");
                return false;
            }
        };
        link.outbound.send(text).is_ok()
    }

    /// Fails all pending calls with `ConnectionClosed`.
    fn fail_pending_calls(realm: Realm, correlation: &Arc<Mutex<CorrelationMap>>) {
        let pending: Vec<_> = correlation.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(%realm, count, "Failed pending calls on shutdown");
        }
    }
}

/// Whole milliseconds of `timeout`, saturating at `u64::MAX`.
#[inline]
fn timeout_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::time::Instant;

    use tokio::sync::Semaphore;

    use crate::bus::pair;
    use crate::protocol::{SendRequest, TransportEvent, TransportEventKind, TransportKind};

    fn send_request(payload: &str) -> BusMessage {
        BusMessage::SendWebSocketMessage(SendRequest {
            payload: payload.to_string(),
            prefer_poll: false,
        })
    }

    #[tokio::test]
    async fn test_call_is_answered_by_peer_handler() {
        let (page, extension) = pair(Realm::Page, Realm::Extension);

        page.on_receive(EventTag::GetActiveWebSocketType, |_| async {
            Ok(Some(json!("poll")))
        });

        let kind: Option<TransportKind> = extension
            .request(
                BusMessage::GetActiveWebSocketType,
                Some(Duration::from_secs(1)),
            )
            .await
            .expect("reply");
        assert_eq!(kind, Some(TransportKind::Poll));
        assert_eq!(extension.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_reaches_caller() {
        let (page, extension) = pair(Realm::Page, Realm::Extension);
        page.on_receive(EventTag::SendWebSocketMessage, |_| async {
            Err::<Option<Value>, _>(Error::NoActiveTransport)
        });

        let err = extension
            .send(send_request("42"), Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        match err {
            Error::Remote { message } => assert!(message.contains("No active transport")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unhandled_with_timeout_is_error() {
        let (_page, extension) = pair(Realm::Page, Realm::Extension);

        let err = extension
            .send(BusMessage::IsWebSocketCaptured, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnhandledEvent { .. }));
    }

    #[tokio::test]
    async fn test_unhandled_without_timeout_resolves_absent() {
        let (_page, extension) = pair(Realm::Page, Realm::Extension);

        let result = extension
            .send(BusMessage::IsWebSocketCaptured, None)
            .await
            .expect("absent value");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_later_registration_replaces_former() {
        let (page, extension) = pair(Realm::Page, Realm::Extension);
        page.on_receive(EventTag::IsWebSocketCaptured, |_| async { Ok(Some(json!(1))) });
        page.on_receive(EventTag::IsWebSocketCaptured, |_| async { Ok(Some(json!(2))) });

        let value = extension
            .send(BusMessage::IsWebSocketCaptured, Some(Duration::from_secs(1)))
            .await
            .expect("reply");
        assert_eq!(value, Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_no_earlier_than_deadline() {
        let (page, extension) = pair(Realm::Page, Realm::Extension);
        page.on_receive(EventTag::IsWebSocketCaptured, |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(json!(true)))
        });

        let started = Instant::now();
        let err = extension
            .send(
                BusMessage::IsWebSocketCaptured,
                Some(Duration::from_millis(250)),
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(300));

        // Give the loop a few turns to retire the id.
        for _ in 0..10 {
            if extension.pending_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(extension.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected_not_fatal() {
        let (page, extension) = pair(Realm::Page, Realm::Extension);
        page.on_receive(EventTag::SendWebSocketMessage, |_| async { Ok(None) });

        let (tx, _rx) = oneshot::channel();
        let envelope = Envelope {
            event: "sendWebSocketMessage".to_string(),
            payload: json!({ "wrong": true }),
            correlation_id: CorrelationId::generate(),
            timeout_ms: Some(1000),
            no_reply: false,
        };
        extension
            .command_tx
            .send(EndpointCommand::Call {
                envelope,
                response_tx: tx,
            })
            .map_err(|_| ())
            .expect("queue");

        // Endpoint still serves well-formed calls afterwards.
        let ok = extension
            .send(send_request("42"), Some(Duration::from_secs(1)))
            .await
            .expect("reply");
        assert!(ok.is_none());
    }

    #[tokio::test]
    async fn test_handlers_for_a_tag_run_in_arrival_order() {
        let (page, extension) = pair(Realm::Page, Realm::Extension);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        page.on_receive(EventTag::SendWebSocketMessage, move |message| {
            let sink = Arc::clone(&sink);
            async move {
                if let BusMessage::SendWebSocketMessage(request) = message {
                    // Earlier calls sleep longer; order must still hold.
                    let delay = 20u64.saturating_sub(request.payload.len() as u64);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    sink.lock().push(request.payload);
                }
                Ok(None)
            }
        });

        for i in 0..5 {
            extension.notify(send_request(&"x".repeat(i + 1)));
        }
        extension
            .send(send_request("done"), Some(Duration::from_secs(2)))
            .await
            .expect("barrier");

        let seen = seen.lock().clone();
        assert_eq!(seen, vec!["x", "xx", "xxx", "xxxx", "xxxxx", "done"]);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_calls() {
        let (page, extension) = pair(Realm::Page, Realm::Extension);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        page.on_receive(EventTag::IsWebSocketCaptured, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(None)
            }
        });

        let caller = extension.clone();
        let pending = tokio::spawn(async move {
            caller.send(BusMessage::IsWebSocketCaptured, None).await
        });

        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        extension.shutdown();

        let result = pending.await.expect("join");
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_notifications_do_not_count_against_call_limit() {
        let (link_a, link_b) = Link::pair();
        let page = BusEndpoint::with_max_pending(Realm::Page, link_a, 4);
        let extension = BusEndpoint::new(Realm::Extension, link_b);

        let gate = Arc::new(Semaphore::new(0));
        let handled = Arc::new(AtomicUsize::new(0));
        let (worker_gate, counter) = (Arc::clone(&gate), Arc::clone(&handled));
        extension.on_receive(EventTag::WebSocketEvent, move |_| {
            let gate = Arc::clone(&worker_gate);
            let counter = Arc::clone(&counter);
            async move {
                gate.acquire()
                    .await
                    .map_err(|_| Error::ConnectionClosed)?
                    .forget();
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(json!("rewritten")))
            }
        });

        for i in 0..150 {
            page.notify(BusMessage::WebSocketEvent(TransportEvent::captured(
                TransportEventKind::Message,
                TransportKind::Duplex,
                format!("42[{i}]"),
            )));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(page.pending_count(), 0);

        let caller = page.clone();
        let call = tokio::spawn(async move {
            caller
                .send(
                    BusMessage::WebSocketEvent(TransportEvent::captured(
                        TransportEventKind::Send,
                        TransportKind::Duplex,
                        "42[\"user\"]",
                    )),
                    Some(Duration::from_secs(5)),
                )
                .await
        });

        gate.add_permits(151);
        let reply = call.await.expect("join").expect("call within limit");
        assert_eq!(reply, Some(json!("rewritten")));
        assert_eq!(handled.load(Ordering::SeqCst), 151);
        assert_eq!(page.pending_count(), 0);
    }

    #[test]
    fn test_timeout_millis_saturates() {
        assert_eq!(timeout_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(timeout_millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_pending_limit() {
        let (link_a, _link_b) = Link::pair();
        let endpoint = BusEndpoint::with_max_pending(Realm::Page, link_a, 1);

        let first = endpoint.clone();
        tokio::spawn(async move { first.send(BusMessage::IsWebSocketCaptured, None).await });
        while endpoint.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let err = endpoint
            .send(BusMessage::IsWebSocketCaptured, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }
}
