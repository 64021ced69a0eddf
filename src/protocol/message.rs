//! Typed bus messages.
//!
//! Each event tag carries its own payload schema. Payloads are checked at
//! the realm boundary via [`BusMessage::from_parts`].
//!
//! # Event Tags
//!
//! | Tag | Direction | Payload |
//! |-----|-----------|---------|
//! | `webSocketEvent` | page → extension | [`TransportEvent`] |
//! | `longPollingEvent` | page → extension | [`PollEvent`] |
//! | `sendWebSocketMessage` | extension → page | [`SendRequest`] |
//! | `getActiveWebSocketType` | extension → page | none |
//! | `isWebSocketCaptured` | extension → page | none |
//! | `isInternalWebSocketInitialized` | extension → page | none |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

// ============================================================================
// EventTag
// ============================================================================

/// Tag identifying a bus handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventTag {
    /// Duplex transport activity.
    WebSocketEvent,
    /// Long-poll request or response unit.
    LongPollingEvent,
    /// Request to send a frame through the active transport.
    SendWebSocketMessage,
    /// Query for the active transport kind.
    GetActiveWebSocketType,
    /// Query whether any transport is captured.
    IsWebSocketCaptured,
    /// Query whether the shadow connection is ready.
    IsInternalWebSocketInitialized,
}

impl EventTag {
    /// All known tags.
    pub const ALL: [Self; 6] = [
        Self::WebSocketEvent,
        Self::LongPollingEvent,
        Self::SendWebSocketMessage,
        Self::GetActiveWebSocketType,
        Self::IsWebSocketCaptured,
        Self::IsInternalWebSocketInitialized,
    ];

    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocketEvent => "webSocketEvent",
            Self::LongPollingEvent => "longPollingEvent",
            Self::SendWebSocketMessage => "sendWebSocketMessage",
            Self::GetActiveWebSocketType => "getActiveWebSocketType",
            Self::IsWebSocketCaptured => "isWebSocketCaptured",
            Self::IsInternalWebSocketInitialized => "isInternalWebSocketInitialized",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == name)
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TransportKind
// ============================================================================

/// Kind of transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent bidirectional socket.
    Duplex,
    /// HTTP long-polling exchange.
    Poll,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplex => f.write_str("duplex"),
            Self::Poll => f.write_str("poll"),
        }
    }
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Lifecycle hook that produced a [`TransportEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportEventKind {
    /// Connection opened.
    Open,
    /// Inbound frame.
    Message,
    /// Connection closed.
    Close,
    /// Outbound frame.
    Send,
}

/// Duplex activity forwarded to the extension realm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEvent {
    /// Which hook fired.
    pub event: TransportEventKind,

    /// Frame text (empty for open, `"closed"` for close).
    #[serde(default)]
    pub payload: String,

    /// Transport that produced the event.
    pub kind: TransportKind,

    /// Set when the event came from the shadow connection.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_internal: bool,
}

impl TransportEvent {
    /// Creates an event from a captured transport.
    #[inline]
    #[must_use]
    pub fn captured(
        event: TransportEventKind,
        kind: TransportKind,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            event,
            payload: payload.into(),
            kind,
            is_internal: false,
        }
    }

    /// Creates an event from the shadow connection.
    #[inline]
    #[must_use]
    pub fn internal(event: TransportEventKind, payload: impl Into<String>) -> Self {
        Self {
            event,
            payload: payload.into(),
            kind: TransportKind::Duplex,
            is_internal: true,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

// ============================================================================
// PollEvent
// ============================================================================

/// Direction of a long-poll unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollEventKind {
    /// Outbound unit, offered for rewriting.
    Request,
    /// Inbound unit.
    Response,
}

/// One long-poll unit forwarded to the extension realm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollEvent {
    /// Direction.
    pub event: PollEventKind,
    /// Unit text.
    pub payload: String,
}

// ============================================================================
// SendRequest
// ============================================================================

/// Request to transmit a frame through the active transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Frame text, including its engine.io prefix.
    pub payload: String,
    /// Route through a one-shot poll exchange even when a duplex is open.
    #[serde(default)]
    pub prefer_poll: bool,
}

// ============================================================================
// BusMessage
// ============================================================================

/// Tagged union of every message the bus carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum BusMessage {
    /// Duplex transport activity.
    WebSocketEvent(TransportEvent),
    /// Long-poll unit.
    LongPollingEvent(PollEvent),
    /// Frame to send through the active transport.
    SendWebSocketMessage(SendRequest),
    /// Active transport kind query.
    GetActiveWebSocketType,
    /// Capture status query.
    IsWebSocketCaptured,
    /// Shadow readiness query.
    IsInternalWebSocketInitialized,
}

impl BusMessage {
    /// Returns the tag of this message.
    #[must_use]
    pub const fn tag(&self) -> EventTag {
        match self {
            Self::WebSocketEvent(_) => EventTag::WebSocketEvent,
            Self::LongPollingEvent(_) => EventTag::LongPollingEvent,
            Self::SendWebSocketMessage(_) => EventTag::SendWebSocketMessage,
            Self::GetActiveWebSocketType => EventTag::GetActiveWebSocketType,
            Self::IsWebSocketCaptured => EventTag::IsWebSocketCaptured,
            Self::IsInternalWebSocketInitialized => EventTag::IsInternalWebSocketInitialized,
        }
    }

    /// Splits into tag and raw payload (`Null` for payload-less tags).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload fails to serialize.
    pub fn to_parts(&self) -> Result<(EventTag, Value)> {
        let value = serde_json::to_value(self)?;
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);
        Ok((self.tag(), payload))
    }

    /// Rebuilds a typed message from tag and raw payload.
    ///
    /// # Errors
    ///
    /// - [`Error::UnhandledEvent`] if the tag is unknown
    /// - [`Error::Protocol`] if the payload does not match the tag's schema
    pub fn from_parts(event: &str, payload: Value) -> Result<Self> {
        let tag = EventTag::parse(event).ok_or_else(|| Error::unhandled_event(event))?;

        let mut object = Map::new();
        object.insert("event".to_string(), Value::String(tag.as_str().to_string()));
        if !payload.is_null() {
            object.insert("payload".to_string(), payload);
        }

        serde_json::from_value(Value::Object(object))
            .map_err(|e| Error::protocol(format!("invalid payload for '{tag}': {e}")))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_names_round_trip() {
        for tag in EventTag::ALL {
            assert_eq!(EventTag::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(EventTag::parse("nope"), None);
    }

    #[test]
    fn test_transport_event_payload_shape() {
        let message = BusMessage::WebSocketEvent(TransportEvent::captured(
            TransportEventKind::Message,
            TransportKind::Duplex,
            "42[\"chat\"]",
        ));
        let (tag, payload) = message.to_parts().expect("parts");

        assert_eq!(tag, EventTag::WebSocketEvent);
        assert_eq!(payload["event"], "message");
        assert_eq!(payload["kind"], "duplex");
        assert!(payload.get("isInternal").is_none());
    }

    #[test]
    fn test_internal_flag_serialized() {
        let message =
            BusMessage::WebSocketEvent(TransportEvent::internal(TransportEventKind::Message, "42"));
        let (_, payload) = message.to_parts().expect("parts");
        assert_eq!(payload["isInternal"], true);
    }

    #[test]
    fn test_unit_variant_has_null_payload() {
        let (tag, payload) = BusMessage::IsWebSocketCaptured.to_parts().expect("parts");
        assert_eq!(tag, EventTag::IsWebSocketCaptured);
        assert!(payload.is_null());

        let back = BusMessage::from_parts("isWebSocketCaptured", Value::Null).expect("parse");
        assert_eq!(back, BusMessage::IsWebSocketCaptured);
    }

    #[test]
    fn test_from_parts_checks_schema() {
        let ok = BusMessage::from_parts(
            "sendWebSocketMessage",
            json!({ "payload": "42[]", "preferPoll": true }),
        )
        .expect("valid");
        assert_eq!(
            ok,
            BusMessage::SendWebSocketMessage(SendRequest {
                payload: "42[]".to_string(),
                prefer_poll: true,
            })
        );

        let err = BusMessage::from_parts("sendWebSocketMessage", json!({ "nope": 1 })).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));

        let err = BusMessage::from_parts("unknownTag", Value::Null).unwrap_err();
        assert!(matches!(err, Error::UnhandledEvent { .. }));
    }
}
