//! Hub link abstractions.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chatpilot_core::ErrorKind;
use chatpilot_transport::{Envelope, Payload, ProtocolError};
use thiserror::Error;

/// Hub link error.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to connect to hub: {0}")]
    Connect(String),
    #[error("Hub link closed")]
    Closed,
    #[error("Hub did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Registration rejected: {0}")]
    Rejected(String),
    #[error("Unexpected hub reply: {0}")]
    Unexpected(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl LinkError {
    /// True if the hub itself is unreachable, as opposed to a bad exchange.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Closed | Self::Timeout(_))
    }

    /// Error kind reported to callers when the exchange itself went wrong.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected(_) => ErrorKind::UnknownClient,
            Self::Timeout(_) => ErrorKind::DispatchTimeout,
            Self::Connect(_) | Self::Closed | Self::Unexpected(_) | Self::Protocol(_) => {
                ErrorKind::MalformedEnvelope
            }
        }
    }
}

/// An established, registered connection to the hub.
#[async_trait]
pub trait HubLink: Send + Sync {
    /// Client id assigned by the hub.
    fn client_id(&self) -> &str;

    /// True once the link is known to be dead without sending anything.
    fn is_closed(&self) -> bool {
        false
    }

    /// Send a request and wait for the envelope echoing its correlation id.
    async fn request(&self, payload: Payload) -> Result<Envelope, LinkError>;
}

/// Opens hub links.
#[async_trait]
pub trait HubConnector: Send + Sync {
    /// Connect and complete the registration handshake.
    async fn connect(&self) -> Result<Arc<dyn HubLink>, LinkError>;
}
