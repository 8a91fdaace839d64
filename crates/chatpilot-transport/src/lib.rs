//! Transport layer for the chatpilot hub.
//!
//! Provides:
//! - Wire protocol (tagged JSON envelopes)
//! - `Hub` - Message router over the registry, session and dispatcher
//! - WebSocket server (feature: websocket)

pub mod protocol;
pub mod router;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::{CommandContext, Envelope, Payload, ProtocolError, decode, encode};
pub use router::{ConnectionContext, Hub, HubBuilder};
