//! Poll exchanges and handles.
//!
//! A [`PollExchange`] is one completed long-poll request as observed by the
//! interceptor. When its response address identifies a polling transport it
//! becomes a [`PollHandle`], which sends frames by running a fresh one-shot
//! exchange against the same address.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use crate::bus::BusEndpoint;
use crate::error::{Error, Result};
use crate::identifiers::HandleId;
use crate::protocol::address::has_session_id;
use crate::protocol::{BusMessage, PollEvent, PollEventKind, TransportKind};

use super::{PollClient, SendOutcome, Transport};

// ============================================================================
// PollState
// ============================================================================

/// Lifecycle of an observed long-poll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Request sent, response pending.
    Pending,
    /// Response fully received.
    Done,
}

// ============================================================================
// PollExchange
// ============================================================================

/// One observed long-poll request/response pair.
#[derive(Debug, Clone)]
pub struct PollExchange {
    /// Final response address.
    pub response_url: String,
    /// Response body.
    pub response_body: String,
    /// Lifecycle state.
    pub state: PollState,
}

impl PollExchange {
    /// Creates a completed exchange.
    #[inline]
    #[must_use]
    pub fn completed(response_url: impl Into<String>, response_body: impl Into<String>) -> Self {
        Self {
            response_url: response_url.into(),
            response_body: response_body.into(),
            state: PollState::Done,
        }
    }
}

// ============================================================================
// PollHandle
// ============================================================================

/// Sends frames through one-shot exchanges against a polling address.
pub struct PollHandle {
    id: HandleId,
    url: String,
    bus: BusEndpoint,
    client: Arc<dyn PollClient>,
    rewrite_timeout: Duration,
}

impl PollHandle {
    /// Creates a handle for a completed polling exchange.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        bus: BusEndpoint,
        client: Arc<dyn PollClient>,
        rewrite_timeout: Duration,
    ) -> Self {
        Self {
            id: HandleId::next(),
            url: url.into(),
            bus,
            client,
            rewrite_timeout,
        }
    }
}

#[async_trait]
impl Transport for PollHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn is_open(&self) -> bool {
        true
    }

    /// # Errors
    ///
    /// - [`Error::Protocol`] if the polling address carries no session id
    /// - [`Error::Url`] if the address cannot be parsed
    /// - [`Error::Http`] / [`Error::Connection`] if the exchange fails
    async fn send(&self, data: String) -> Result<SendOutcome> {
        if !has_session_id(&self.url) {
            return Err(Error::protocol(format!(
                "polling address has no session id: {}",
                self.url
            )));
        }
        let url = Url::parse(&self.url)?;
        let response = one_shot_exchange(
            &self.bus,
            self.client.as_ref(),
            &url,
            data,
            self.rewrite_timeout,
        )
        .await?;
        Ok(SendOutcome::Polled { response })
    }
}

// ============================================================================
// One-shot exchange
// ============================================================================

/// Offers `data` for rewriting, then posts the result to `url`.
///
/// A string reply replaces the body; anything else (including a failed
/// rewrite call) leaves the original body untouched.
pub(crate) async fn one_shot_exchange(
    bus: &BusEndpoint,
    client: &dyn PollClient,
    url: &Url,
    data: String,
    rewrite_timeout: Duration,
) -> Result<String> {
    let request = BusMessage::LongPollingEvent(PollEvent {
        event: PollEventKind::Request,
        payload: data.clone(),
    });

    let body = match bus.send(request, Some(rewrite_timeout)).await {
        Ok(Some(Value::String(rewritten))) => rewritten,
        Ok(_) => data,
        Err(e) => {
            debug!(error = %e, "Poll rewrite unavailable, posting original body");
            data
        }
    };

    trace!(%url, len = body.len(), "Posting one-shot poll exchange");
    client.post(url, body).await
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bus::{self, Realm};
    use crate::protocol::EventTag;
    use crate::transport::testing::MockPollClient;

    const POLL_URL: &str = "https://chat.test/socket.io/?EIO=4&transport=polling&sid=abc";

    #[tokio::test]
    async fn test_send_posts_rewritten_body() {
        let (page, extension) = bus::pair(Realm::Page, Realm::Extension);
        extension.on_receive(EventTag::LongPollingEvent, |message| async move {
            match message {
                BusMessage::LongPollingEvent(event) => {
                    Ok(Some(Value::String(format!("{}!", event.payload))))
                }
                _ => Ok(None),
            }
        });

        let client = MockPollClient::with_get_body("");
        let handle = PollHandle::new(POLL_URL, page, client.clone(), Duration::from_secs(1));

        let outcome = handle.send("42[\"hi\"]".to_string()).await.expect("send");
        assert_eq!(
            outcome,
            SendOutcome::Polled {
                response: "ok".to_string()
            }
        );
        assert_eq!(
            client.posts(),
            vec![(POLL_URL.to_string(), "42[\"hi\"]!".to_string())]
        );
    }

    #[tokio::test]
    async fn test_send_without_rewriter_posts_original() {
        let (page, _extension) = bus::pair(Realm::Page, Realm::Extension);
        let client = MockPollClient::with_get_body("");
        let handle = PollHandle::new(POLL_URL, page, client.clone(), Duration::from_secs(1));

        handle.send("42[\"raw\"]".to_string()).await.expect("send");
        assert_eq!(client.posts()[0].1, "42[\"raw\"]");
    }

    #[tokio::test]
    async fn test_send_requires_session_id() {
        let (page, _extension) = bus::pair(Realm::Page, Realm::Extension);
        let client = MockPollClient::with_get_body("");
        let handle = PollHandle::new(
            "https://chat.test/socket.io/?EIO=4&transport=polling",
            page,
            client.clone(),
            Duration::from_secs(1),
        );

        let err = handle.send("42".to_string()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert!(client.posts().is_empty());
    }
}
