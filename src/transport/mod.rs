//! Transport handles.
//!
//! Two layers live here:
//!
//! - [`NativeDuplex`]: the raw socket surface the application owns
//!   (URL, ready state, transmit, event stream). [`WsDuplex`] implements it
//!   over tokio-tungstenite.
//! - [`Transport`]: the capability the relay sends through. Captured sockets
//!   are wrapped in [`CapturedDuplex`]; completed polling exchanges become
//!   [`PollHandle`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   wraps    ┌────────────────┐   bus    ┌─────────────┐
//! │ NativeDuplex │ ─────────► │ CapturedDuplex │ ───────► │  Extension  │
//! │ (app socket) │            │  (Transport)   │          │  realm      │
//! └──────────────┘            └────────────────┘          └─────────────┘
//! ┌──────────────┐  becomes   ┌────────────────┐
//! │ PollExchange │ ─────────► │   PollHandle   │ ── PollClient ──► backend
//! └──────────────┘            │  (Transport)   │
//!                             └────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `captured` | Decorator around a captured application socket |
//! | `http` | Long-poll HTTP client |
//! | `poll` | Poll exchanges and handles |
//! | `ws` | tokio-tungstenite duplex socket |

// ============================================================================
// Submodules
// ============================================================================

/// Captured duplex decorator.
pub mod captured;

/// Long-poll HTTP client.
pub mod http;

/// Poll exchanges and handles.
pub mod poll;

/// WebSocket duplex socket.
pub mod ws;

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::identifiers::HandleId;
use crate::protocol::TransportKind;

// ============================================================================
// Re-exports
// ============================================================================

pub use captured::CapturedDuplex;
pub use http::{HttpPollClient, PollClient};
pub use poll::{PollExchange, PollHandle, PollState};
pub use ws::WsDuplex;

// ============================================================================
// ReadyState
// ============================================================================

/// Duplex connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Handshake in progress.
    Connecting,
    /// Frames can flow.
    Open,
    /// Terminated.
    Closed,
}

// ============================================================================
// DuplexEvent
// ============================================================================

/// Event emitted by a duplex socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplexEvent {
    /// Connection opened.
    Open,
    /// Inbound text frame.
    Message(String),
    /// Connection closed.
    Close,
}

// ============================================================================
// EventFanout
// ============================================================================

/// Delivers every duplex event to every subscriber, in emission order.
///
/// Each subscriber gets its own unbounded queue, so a slow reader never
/// loses frames. Dropped receivers are pruned on the next emit.
#[derive(Default)]
pub struct EventFanout {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DuplexEvent>>>,
}

impl EventFanout {
    /// Creates a fanout with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DuplexEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Sends `event` to every live subscriber.
    pub fn emit(&self, event: DuplexEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    #[inline]
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

// ============================================================================
// NativeDuplex
// ============================================================================

/// Raw surface of a duplex socket owned by the application.
///
/// The relay never opens or closes these; it only observes and sends.
pub trait NativeDuplex: Send + Sync {
    /// Stable identity used by the capture registry.
    fn id(&self) -> HandleId;

    /// Socket address.
    fn url(&self) -> &str;

    /// Current state.
    fn ready_state(&self) -> ReadyState;

    /// Writes a text frame as-is.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ConnectionClosed`] if the socket is closed.
    fn transmit(&self, text: String) -> Result<()>;

    /// Subscribes to events emitted from now on. Nothing is dropped for a
    /// slow subscriber.
    fn events(&self) -> mpsc::UnboundedReceiver<DuplexEvent>;
}

// ============================================================================
// SendOutcome
// ============================================================================

/// What happened to a frame handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SendOutcome {
    /// Written to a captured duplex socket.
    Transmitted,
    /// Written to the shadow connection.
    Shadow,
    /// Dropped because no rewritten text frame came back.
    Suppressed,
    /// Delivered by a one-shot poll exchange.
    Polled {
        /// Backend response body.
        response: String,
    },
}

// ============================================================================
// Transport
// ============================================================================

/// Capability shared by every handle the relay can send through.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Handle identity.
    fn id(&self) -> HandleId;

    /// Transport kind.
    fn kind(&self) -> TransportKind;

    /// Address frames are sent to.
    fn url(&self) -> String;

    /// Returns `true` while the handle can carry frames.
    fn is_open(&self) -> bool;

    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// Transport specific; see implementors.
    async fn send(&self, data: String) -> Result<SendOutcome>;
}

// ============================================================================
// Tests
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fanout_keeps_every_event_for_slow_subscribers() {
        let fanout = EventFanout::new();
        let mut fast = fanout.subscribe();
        let mut slow = fanout.subscribe();

        for i in 0..1_000 {
            fanout.emit(DuplexEvent::Message(i.to_string()));
        }
        fanout.emit(DuplexEvent::Close);

        for i in 0..1_000 {
            assert_eq!(fast.recv().await, Some(DuplexEvent::Message(i.to_string())));
        }
        assert_eq!(fast.recv().await, Some(DuplexEvent::Close));

        let mut received = 0;
        while let Some(DuplexEvent::Message(text)) = slow.recv().await {
            assert_eq!(text, received.to_string());
            received += 1;
        }
        assert_eq!(received, 1_000);
    }

    #[test]
    fn test_fanout_prunes_dropped_receivers() {
        let fanout = EventFanout::new();
        let kept = fanout.subscribe();
        drop(fanout.subscribe());

        fanout.emit(DuplexEvent::Open);
        assert_eq!(fanout.subscriber_count(), 1);
        drop(kept);
    }
}
