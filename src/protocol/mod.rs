//! Protocol codec.
//!
//! Pure functions and message types, no state:
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Envelope` | Realm A → Realm B | Bus call tagged by `event` |
//! | `Reply` | Realm B → Realm A | Result or error for a call |
//! | `BusMessage` | both | Typed payload keyed by event tag |
//! | `Frame` | captured socket | Engine.io / socket.io duplex frame |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `address` | Engine.io URL inspection and rewriting |
//! | `envelope` | Bus wire envelope and reply |
//! | `frame` | Duplex frame prefix parsing |
//! | `message` | Event tags and their payload schemas |
//! | `poll` | Long-poll body splitting and joining |

// ============================================================================
// Submodules
// ============================================================================

/// Engine.io URL inspection and rewriting.
pub mod address;

/// Bus wire envelope and reply.
pub mod envelope;

/// Duplex frame parsing.
pub mod frame;

/// Typed bus messages.
pub mod message;

/// Long-poll body units.
pub mod poll;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::{Envelope, Reply, WireMessage};
pub use frame::{Frame, OpenHandshake, PacketType};
pub use message::{
    BusMessage, EventTag, PollEvent, PollEventKind, SendRequest, TransportEvent,
    TransportEventKind, TransportKind,
};
