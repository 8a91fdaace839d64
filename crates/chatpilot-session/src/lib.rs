//! Connection registry, shared session state and intent dispatch.
//!
//! Provides:
//! - `ConnectionRegistry` - Registered clients and broadcast fan-out
//! - `SessionStore` - Shared session plus per-client history
//! - `DispatchCoordinator` - Backend calls with retry, timeout and session updates
//! - Conversation store implementations (memory)

use std::time::{SystemTime, UNIX_EPOCH};

pub mod dispatch;
pub mod registry;
pub mod storage;
pub mod store;

pub use dispatch::{DispatchCoordinator, DispatchError, DispatchOutcome, PendingRequest};
pub use registry::{
    BroadcastReport, ClientId, ClientInfo, Connection, ConnectionId, ConnectionRegistry, RegistryError,
    RegistryEvent,
};
pub use store::{SessionStore, SessionUpdate};

/// Current Unix time in seconds.
pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
