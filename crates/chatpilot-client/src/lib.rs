//! Client side of the chatpilot hub.
//!
//! Provides:
//! - `HubConnector` / `HubLink` - Seams for reaching the hub
//! - `WsConnector` - WebSocket link with correlation table and keepalive
//! - `DirectExecutor` - Local interpretation and execution while the hub is away
//! - `FallbackController` - Connected / Reconnecting / Degraded state machine

pub mod direct;
pub mod fallback;
pub mod link;
pub mod ws;

pub use direct::DirectExecutor;
pub use fallback::{FallbackController, LinkState, Reply, Route};
pub use link::{HubConnector, HubLink, LinkError};
pub use ws::{WsConnector, WsLink};
