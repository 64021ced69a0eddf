//! Captured duplex decorator.
//!
//! Wraps an application socket so that its outbound frames are offered to
//! the extension realm first. Only a text reply is written to the wire; any
//! other reply (or a failed call) suppresses the frame.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::bus::BusEndpoint;
use crate::error::Result;
use crate::identifiers::HandleId;
use crate::protocol::{BusMessage, TransportEvent, TransportEventKind, TransportKind};

use super::{NativeDuplex, ReadyState, SendOutcome, Transport};

// ============================================================================
// CapturedDuplex
// ============================================================================

/// An application socket under relay control.
pub struct CapturedDuplex {
    native: Arc<dyn NativeDuplex>,
    bus: BusEndpoint,
    rewrite_timeout: Duration,
}

impl CapturedDuplex {
    /// Wraps `native`.
    #[must_use]
    pub fn new(native: Arc<dyn NativeDuplex>, bus: BusEndpoint, rewrite_timeout: Duration) -> Self {
        Self {
            native,
            bus,
            rewrite_timeout,
        }
    }

    /// Returns the wrapped socket.
    #[inline]
    #[must_use]
    pub fn native(&self) -> &Arc<dyn NativeDuplex> {
        &self.native
    }

    /// Writes `data` without the rewrite round-trip, then reports it as a
    /// `send` event.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ConnectionClosed`] if the socket is closed.
    pub fn transmit_direct(&self, data: String) -> Result<()> {
        self.native.transmit(data.clone())?;
        self.bus.notify(BusMessage::WebSocketEvent(TransportEvent::captured(
            TransportEventKind::Send,
            TransportKind::Duplex,
            data,
        )));
        Ok(())
    }
}

#[async_trait]
impl Transport for CapturedDuplex {
    fn id(&self) -> HandleId {
        self.native.id()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }

    fn url(&self) -> String {
        self.native.url().to_string()
    }

    fn is_open(&self) -> bool {
        self.native.ready_state() == ReadyState::Open
    }

    /// # Errors
    ///
    /// Returns [`crate::Error::ConnectionClosed`] if the rewritten frame
    /// cannot be written.
    async fn send(&self, data: String) -> Result<SendOutcome> {
        let event = BusMessage::WebSocketEvent(TransportEvent::captured(
            TransportEventKind::Send,
            TransportKind::Duplex,
            data,
        ));

        match self.bus.send(event, Some(self.rewrite_timeout)).await {
            Ok(Some(Value::String(text))) => {
                self.native.transmit(text)?;
                Ok(SendOutcome::Transmitted)
            }
            Ok(other) => {
                debug!(handle = %self.id(), reply = ?other, "Frame suppressed");
                Ok(SendOutcome::Suppressed)
            }
            Err(e) => {
                debug!(handle = %self.id(), error = %e, "Frame suppressed");
                Ok(SendOutcome::Suppressed)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bus::{self, Realm};
    use crate::protocol::EventTag;
    use crate::transport::testing::MockDuplex;

    #[tokio::test]
    async fn test_string_reply_is_transmitted() {
        let (page, extension) = bus::pair(Realm::Page, Realm::Extension);
        extension.on_receive(EventTag::WebSocketEvent, |message| async move {
            match message {
                BusMessage::WebSocketEvent(event) => {
                    Ok(Some(Value::String(event.payload.replace("a", "b"))))
                }
                _ => Ok(None),
            }
        });

        let native = MockDuplex::open("wss://chat.test/socket.io/?EIO=4&transport=websocket");
        let captured = CapturedDuplex::new(native.clone(), page, Duration::from_secs(5));

        let outcome = captured.send("42[\"aa\"]".to_string()).await.expect("send");
        assert_eq!(outcome, SendOutcome::Transmitted);
        assert_eq!(native.sent(), vec!["42[\"bb\"]".to_string()]);
    }

    #[tokio::test]
    async fn test_null_reply_suppresses() {
        let (page, extension) = bus::pair(Realm::Page, Realm::Extension);
        extension.on_receive(EventTag::WebSocketEvent, |_| async { Ok(None) });

        let native = MockDuplex::open("wss://chat.test/");
        let captured = CapturedDuplex::new(native.clone(), page, Duration::from_secs(5));

        let outcome = captured.send("42".to_string()).await.expect("send");
        assert_eq!(outcome, SendOutcome::Suppressed);
        assert!(native.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_handler_suppresses() {
        let (page, _extension) = bus::pair(Realm::Page, Realm::Extension);
        let native = MockDuplex::open("wss://chat.test/");
        let captured = CapturedDuplex::new(native.clone(), page, Duration::from_secs(5));

        let outcome = captured.send("42".to_string()).await.expect("send");
        assert_eq!(outcome, SendOutcome::Suppressed);
        assert!(native.sent().is_empty());
    }

    #[tokio::test]
    async fn test_transmit_direct_reports_send() {
        let (page, extension) = bus::pair(Realm::Page, Realm::Extension);
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        extension.on_receive(EventTag::WebSocketEvent, move |message| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(message);
                Ok(None)
            }
        });

        let native = MockDuplex::open("wss://chat.test/");
        let captured = CapturedDuplex::new(native.clone(), page, Duration::from_secs(5));
        captured.transmit_direct("42[\"x\"]".to_string()).expect("transmit");

        assert_eq!(native.sent(), vec!["42[\"x\"]".to_string()]);
        let seen = seen_rx.recv().await.expect("event");
        assert_eq!(
            seen,
            BusMessage::WebSocketEvent(TransportEvent::captured(
                TransportEventKind::Send,
                TransportKind::Duplex,
                "42[\"x\"]",
            ))
        );
    }
}
