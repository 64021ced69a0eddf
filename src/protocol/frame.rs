//! Duplex frame parsing.
//!
//! Captured frames are engine.io v4 packets: a single type digit followed by
//! data. Message packets (`4`) carry a socket.io packet whose own type digit
//! distinguishes the session acknowledgement (`0`) from data.
//!
//! | Text | Engine type | Classification |
//! |------|-------------|----------------|
//! | `0{"sid":..}` | open | [`Frame::Open`] |
//! | `2` / `3` / `2probe` | ping / pong | [`Frame::Control`] |
//! | `40{"sid":..}` | message + connect | [`Frame::SessionAck`] |
//! | `42[...]` | message + event | [`Frame::Data`] |

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Engine.io ping packet.
pub const PING: &str = "2";

/// Engine.io pong packet.
pub const PONG: &str = "3";

/// Upgrade probe sent over the new socket.
pub const PROBE_PING: &str = "2probe";

/// Server answer to [`PROBE_PING`].
pub const PROBE_PONG: &str = "3probe";

/// Completes a transport upgrade.
pub const UPGRADE: &str = "5";

/// Socket.io connect to the default namespace, wrapped in an engine message.
pub const CONNECT: &str = "40";

// ============================================================================
// PacketType
// ============================================================================

/// Engine.io packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Session establishment.
    Open,
    /// Transport close.
    Close,
    /// Keepalive ping.
    Ping,
    /// Keepalive pong.
    Pong,
    /// Application data.
    Message,
    /// Transport upgrade.
    Upgrade,
    /// No-op.
    Noop,
}

impl PacketType {
    /// Maps the leading digit of a frame.
    #[must_use]
    pub const fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            b'0' => Some(Self::Open),
            b'1' => Some(Self::Close),
            b'2' => Some(Self::Ping),
            b'3' => Some(Self::Pong),
            b'4' => Some(Self::Message),
            b'5' => Some(Self::Upgrade),
            b'6' => Some(Self::Noop),
            _ => None,
        }
    }
}

// ============================================================================
// OpenHandshake
// ============================================================================

/// Payload of an engine.io open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Session id.
    pub sid: String,
    /// Transports the server allows upgrading to.
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Server ping interval (ms).
    #[serde(default)]
    pub ping_interval: u64,
    /// Server ping timeout (ms).
    #[serde(default)]
    pub ping_timeout: u64,
    /// Maximum payload size.
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Deserialize)]
struct ConnectAck {
    sid: String,
}

// ============================================================================
// Frame
// ============================================================================

/// A classified duplex frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Engine.io session establishment.
    Open(OpenHandshake),
    /// Socket.io namespace connect acknowledgement.
    SessionAck {
        /// Socket.io session id.
        sid: String,
    },
    /// Engine.io message carrying application data (prefix stripped).
    Data(&'a str),
    /// Any other engine.io packet.
    Control {
        /// Packet type.
        packet: PacketType,
        /// Remaining text after the type digit.
        data: &'a str,
    },
}

impl<'a> Frame<'a> {
    /// Parses a frame's prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFrame`] for empty text, unknown type digits,
    /// or an open packet with an unparseable body.
    pub fn parse(text: &'a str) -> Result<Self> {
        let first = *text
            .as_bytes()
            .first()
            .ok_or_else(|| Error::malformed_frame("empty frame"))?;
        let packet = PacketType::from_digit(first)
            .ok_or_else(|| Error::malformed_frame(format!("unknown packet type '{}'", first as char)))?;
        let data = &text[1..];

        match packet {
            PacketType::Open => {
                let handshake = serde_json::from_str(data)
                    .map_err(|e| Error::malformed_frame(format!("bad open packet: {e}")))?;
                Ok(Self::Open(handshake))
            }
            PacketType::Message => match parse_session_ack(data) {
                Some(sid) => Ok(Self::SessionAck { sid }),
                None => Ok(Self::Data(data)),
            },
            _ => Ok(Self::Control { packet, data }),
        }
    }

    /// Returns `true` for frames that carry application data.
    #[inline]
    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }
}

/// Recognises a socket.io connect acknowledgement in engine message data.
///
/// Accepts `0{"sid":..}` and namespaced `0/chat,{"sid":..}`.
#[must_use]
pub fn parse_session_ack(data: &str) -> Option<String> {
    let rest = data.strip_prefix('0')?;
    let body = match rest.strip_prefix('/') {
        Some(namespaced) => namespaced.split_once(',')?.1,
        None => rest,
    };
    serde_json::from_str::<ConnectAck>(body).ok().map(|ack| ack.sid)
}

/// Wraps application data in an engine.io message packet.
#[inline]
#[must_use]
pub fn encode_message(data: &str) -> String {
    format!("4{data}")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_packet() {
        let frame = Frame::parse(
            r#"0{"sid":"abc","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000}"#,
        )
        .expect("parse");
        match frame {
            Frame::Open(handshake) => {
                assert_eq!(handshake.sid, "abc");
                assert_eq!(handshake.upgrades, vec!["websocket".to_string()]);
                assert_eq!(handshake.ping_interval, 25000);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_session_ack() {
        assert_eq!(
            Frame::parse(r#"40{"sid":"xyz"}"#).expect("parse"),
            Frame::SessionAck {
                sid: "xyz".to_string()
            }
        );
        assert_eq!(
            parse_session_ack(r#"0/chat,{"sid":"n1"}"#),
            Some("n1".to_string())
        );
    }

    #[test]
    fn test_data_and_control() {
        let frame = Frame::parse(r#"42["message",{"text":"hi"}]"#).expect("parse");
        assert!(frame.is_data());
        assert_eq!(frame, Frame::Data(r#"2["message",{"text":"hi"}]"#));

        assert_eq!(
            Frame::parse(PROBE_PONG).expect("parse"),
            Frame::Control {
                packet: PacketType::Pong,
                data: "probe"
            }
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            Frame::parse("").unwrap_err(),
            Error::MalformedFrame { .. }
        ));
        assert!(matches!(
            Frame::parse("9hello").unwrap_err(),
            Error::MalformedFrame { .. }
        ));
        assert!(matches!(
            Frame::parse("0not-json").unwrap_err(),
            Error::MalformedFrame { .. }
        ));
    }

    #[test]
    fn test_encode_message() {
        assert_eq!(encode_message("2[\"x\"]"), "42[\"x\"]");
    }
}
