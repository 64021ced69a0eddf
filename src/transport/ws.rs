//! WebSocket duplex socket.
//!
//! [`WsDuplex`] owns a tokio-tungstenite client stream. A spawned task
//! handles:
//!
//! - Incoming text frames (fanned out as [`DuplexEvent::Message`])
//! - Outgoing frames queued by [`NativeDuplex::transmit`]
//! - Close from either side (state becomes `Closed`, then `Close` is emitted)

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::HandleId;

use super::{DuplexEvent, EventFanout, NativeDuplex, ReadyState};

// ============================================================================
// Types
// ============================================================================

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Internal commands for the socket task.
enum SocketCommand {
    /// Write a text frame.
    Send(String),
    /// Close the socket.
    Close,
}

// ============================================================================
// WsDuplex
// ============================================================================

/// Client WebSocket implementing [`NativeDuplex`].
pub struct WsDuplex {
    id: HandleId,
    url: String,
    state: Arc<Mutex<ReadyState>>,
    command_tx: mpsc::UnboundedSender<SocketCommand>,
    events: Arc<EventFanout>,
}

impl WsDuplex {
    /// Connects and spawns the socket task.
    ///
    /// Returns the socket together with a receiver subscribed before the
    /// first event, so the caller sees `Open` and every frame after it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] if the upgrade fails.
    pub async fn connect(
        url: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<DuplexEvent>)> {
        let (stream, _response) = tokio_tungstenite::connect_async(url).await?;

        let events = Arc::new(EventFanout::new());
        let first_rx = events.subscribe();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ReadyState::Open));

        let socket = Arc::new(Self {
            id: HandleId::next(),
            url: url.to_string(),
            state: Arc::clone(&state),
            command_tx,
            events: Arc::clone(&events),
        });

        debug!(handle = %socket.id, %url, "WebSocket connected");
        events.emit(DuplexEvent::Open);

        tokio::spawn(Self::run_socket_loop(
            socket.id, stream, command_rx, state, events,
        ));

        Ok((socket, first_rx))
    }

    /// Closes the socket.
    pub fn close(&self) {
        let _ = self.command_tx.send(SocketCommand::Close);
    }

    /// Socket task.
    async fn run_socket_loop(
        id: HandleId,
        stream: ClientStream,
        mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
        state: Arc<Mutex<ReadyState>>,
        events: Arc<EventFanout>,
    ) {
        let (mut ws_write, mut ws_read) = stream.split();

        loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            trace!(handle = %id, len = text.len(), "Frame received");
                            events.emit(DuplexEvent::Message(text.to_string()));
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!(handle = %id, "WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(handle = %id, error = %e, "WebSocket error");
                            break;
                        }

                        None => {
                            debug!(handle = %id, "WebSocket stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(SocketCommand::Send(text)) => {
                            if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                                warn!(handle = %id, error = %e, "Failed to write frame");
                                break;
                            }
                        }

                        Some(SocketCommand::Close) | None => {
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }

        *state.lock() = ReadyState::Closed;
        events.emit(DuplexEvent::Close);
        debug!(handle = %id, "Socket task terminated");
    }
}

impl NativeDuplex for WsDuplex {
    fn id(&self) -> HandleId {
        self.id
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }

    fn transmit(&self, text: String) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(Error::ConnectionClosed);
        }
        self.command_tx
            .send(SocketCommand::Send(text))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn events(&self) -> mpsc::UnboundedReceiver<DuplexEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_echo_round_trip_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(format!("echo:{text}").into()))
                    .await
                    .expect("echo");
            }
            let _ = ws.close(None).await;
        });

        let (socket, mut events) = WsDuplex::connect(&format!("ws://127.0.0.1:{port}"))
            .await
            .expect("connect");
        assert_eq!(events.recv().await, Some(DuplexEvent::Open));
        assert_eq!(socket.ready_state(), ReadyState::Open);

        socket.transmit("hi".to_string()).expect("transmit");
        assert_eq!(
            events.recv().await,
            Some(DuplexEvent::Message("echo:hi".to_string()))
        );

        assert_eq!(events.recv().await, Some(DuplexEvent::Close));
        assert_eq!(socket.ready_state(), ReadyState::Closed);
        assert!(matches!(
            socket.transmit("late".to_string()),
            Err(Error::ConnectionClosed)
        ));
    }
}
