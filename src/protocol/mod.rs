//! Push channel protocol
//!
//! Closed event types for both directions plus the connection handshake.

mod events;
mod handshake;

pub use events::{ClientEvent, Envelope, EventKind, OutboundMessage, ServerEvent};
pub use handshake::Handshake;
