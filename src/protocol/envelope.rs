//! Bus wire envelope and reply.
//!
//! Everything crossing a realm boundary is one JSON text of either shape.
//!
//! # Format
//!
//! Call:
//! ```json
//! {
//!   "event": "webSocketEvent",
//!   "payload": { ... },
//!   "correlationId": "uuid",
//!   "timeoutMs": 5000
//! }
//! ```
//!
//! A notification carries `"noReply": true` and is never answered.
//!
//! Reply:
//! ```json
//! {
//!   "correlationId": "uuid",
//!   "result": { ... },
//!   "error": "message"
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::CorrelationId;

use super::BusMessage;

// ============================================================================
// Envelope
// ============================================================================

/// A bus call from one realm to another.
///
/// `event` stays a raw string on the wire so that a receiver can tell an
/// unknown tag apart from a malformed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Tag identifying the handler.
    pub event: String,

    /// Tag-specific payload.
    #[serde(default)]
    pub payload: Value,

    /// Assigned by the sending bus endpoint.
    pub correlation_id: CorrelationId,

    /// Caller's timeout; absence means the caller waits indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Fire-and-forget call: the receiver runs the handler and sends
    /// nothing back.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_reply: bool,
}

impl Envelope {
    /// Builds an envelope from a typed message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload fails to serialize.
    pub fn new(
        message: &BusMessage,
        correlation_id: CorrelationId,
        timeout_ms: Option<u64>,
    ) -> Result<Self> {
        let (tag, payload) = message.to_parts()?;
        Ok(Self {
            event: tag.as_str().to_string(),
            payload,
            correlation_id,
            timeout_ms,
            no_reply: false,
        })
    }

    /// Builds a notification envelope, which the receiver never answers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload fails to serialize.
    pub fn notification(message: &BusMessage) -> Result<Self> {
        let mut envelope = Self::new(message, CorrelationId::generate(), None)?;
        envelope.no_reply = true;
        Ok(envelope)
    }

    /// Converts the raw tag and payload into a typed message.
    ///
    /// # Errors
    ///
    /// - [`Error::UnhandledEvent`] if the tag is unknown
    /// - [`Error::Protocol`] if the payload does not match the tag's schema
    pub fn message(&self) -> Result<BusMessage> {
        BusMessage::from_parts(&self.event, self.payload.clone())
    }
}

// ============================================================================
// Reply
// ============================================================================

/// Resolution of a bus call, mirrored back by correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    /// Matches the envelope's correlation id.
    pub correlation_id: CorrelationId,

    /// Handler return value; absent means "no value".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Handler failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    /// Creates a success reply.
    #[inline]
    #[must_use]
    pub fn success(correlation_id: CorrelationId, result: Option<Value>) -> Self {
        Self {
            correlation_id,
            result,
            error: None,
        }
    }

    /// Creates an error reply.
    #[inline]
    #[must_use]
    pub fn failure(correlation_id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            correlation_id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Extracts the result, mapping an error field to [`Error::Remote`].
    ///
    /// The unhandled-event marker is mapped back to [`Error::UnhandledEvent`].
    ///
    /// # Errors
    ///
    /// Returns the remote failure, if any.
    pub fn into_result(self) -> Result<Option<Value>> {
        match self.error {
            None => Ok(self.result),
            Some(message) => match message.strip_prefix(UNHANDLED_PREFIX) {
                Some(event) => Err(Error::unhandled_event(event)),
                None => Err(Error::remote(message)),
            },
        }
    }
}

/// Error prefix used on the wire for a missing handler.
pub(crate) const UNHANDLED_PREFIX: &str = "unhandled event: ";

// ============================================================================
// WireMessage
// ============================================================================

/// Either shape of a bus frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Incoming call.
    Call(Envelope),
    /// Incoming reply.
    Reply(Reply),
}

impl WireMessage {
    /// Serializes to the wire text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on serialization failure.
    pub fn encode(&self) -> Result<String> {
        let text = match self {
            Self::Call(envelope) => serde_json::to_string(envelope)?,
            Self::Reply(reply) => serde_json::to_string(reply)?,
        };
        Ok(text)
    }

    /// Parses wire text.
    ///
    /// Objects with an `event` field are calls, everything else is a reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFrame`] if the text is neither shape.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::malformed_frame(format!("bus frame is not JSON: {e}")))?;

        if value.get("event").is_some() {
            let envelope = serde_json::from_value(value)
                .map_err(|e| Error::malformed_frame(format!("bad envelope: {e}")))?;
            return Ok(Self::Call(envelope));
        }

        let reply = serde_json::from_value(value)
            .map_err(|e| Error::malformed_frame(format!("bad reply: {e}")))?;
        Ok(Self::Reply(reply))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SendRequest, TransportKind};

    #[test]
    fn test_envelope_wire_shape() {
        let id = CorrelationId::generate();
        let message = BusMessage::SendWebSocketMessage(SendRequest {
            payload: "42[\"ping\"]".to_string(),
            prefer_poll: false,
        });
        let envelope = Envelope::new(&message, id, Some(1000)).expect("envelope");
        let text = WireMessage::Call(envelope).encode().expect("encode");

        assert!(text.contains("\"event\":\"sendWebSocketMessage\""));
        assert!(text.contains("\"correlationId\""));
        assert!(text.contains("\"timeoutMs\":1000"));
    }

    #[test]
    fn test_envelope_without_timeout_omits_field() {
        let envelope = Envelope::new(
            &BusMessage::IsWebSocketCaptured,
            CorrelationId::generate(),
            None,
        )
        .expect("envelope");
        let text = WireMessage::Call(envelope).encode().expect("encode");
        assert!(!text.contains("timeoutMs"));
        assert!(!text.contains("noReply"));
    }

    #[test]
    fn test_notification_flag_survives_the_wire() {
        let envelope =
            Envelope::notification(&BusMessage::IsWebSocketCaptured).expect("envelope");
        let text = WireMessage::Call(envelope.clone()).encode().expect("encode");
        assert!(text.contains("\"noReply\":true"));

        match WireMessage::decode(&text).expect("decode") {
            WireMessage::Call(decoded) => {
                assert!(decoded.no_reply);
                assert_eq!(decoded, envelope);
            }
            WireMessage::Reply(_) => panic!("expected call"),
        }
    }

    #[test]
    fn test_decode_call_and_reply() {
        let id = CorrelationId::generate();
        let call = format!(r#"{{"event":"isWebSocketCaptured","correlationId":"{id}"}}"#);
        match WireMessage::decode(&call).expect("decode call") {
            WireMessage::Call(envelope) => {
                assert_eq!(envelope.correlation_id, id);
                assert_eq!(
                    envelope.message().expect("typed"),
                    BusMessage::IsWebSocketCaptured
                );
            }
            WireMessage::Reply(_) => panic!("expected call"),
        }

        let reply = format!(r#"{{"correlationId":"{id}","result":"duplex"}}"#);
        match WireMessage::decode(&reply).expect("decode reply") {
            WireMessage::Reply(reply) => {
                let value = reply.into_result().expect("ok").expect("some");
                let kind: TransportKind = serde_json::from_value(value).expect("kind");
                assert_eq!(kind, TransportKind::Duplex);
            }
            WireMessage::Call(_) => panic!("expected reply"),
        }
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let err = WireMessage::decode("not json").unwrap_err();
        assert!(matches!(err, Error::MalformedFrame { .. }));

        let err = WireMessage::decode(r#"{"result": 1}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame { .. }));
    }

    #[test]
    fn test_reply_error_mapping() {
        let id = CorrelationId::generate();
        let err = Reply::failure(id, "boom").into_result().unwrap_err();
        assert!(matches!(err, Error::Remote { .. }));

        let err = Reply::failure(id, format!("{UNHANDLED_PREFIX}webSocketEvent"))
            .into_result()
            .unwrap_err();
        match err {
            Error::UnhandledEvent { event } => assert_eq!(event, "webSocketEvent"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
