//! Wire-level error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classified error carried by `error` envelopes.
///
/// Every failure the hub reports to a client maps onto exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Envelope could not be decoded (bad JSON, unknown kind, missing fields).
    MalformedEnvelope,
    /// Envelope kind is known but has no inbound handler.
    UnsupportedKind,
    /// Connection attempted to register a second time.
    DuplicateRegistration,
    /// Client id is not registered.
    UnknownClient,
    /// A reference could not be pinned to a single contact.
    AmbiguousReference,
    /// No directory entry matched closely enough.
    UnresolvedContact,
    /// Parsed action has no matching intent shape.
    UnsupportedCommand,
    /// Backend (or model) did not answer within the deadline.
    DispatchTimeout,
    /// Backend reported a failure.
    BackendFailure,
}

impl ErrorKind {
    /// Stable snake_case name, identical to the serialized form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedEnvelope => "malformed_envelope",
            Self::UnsupportedKind => "unsupported_kind",
            Self::DuplicateRegistration => "duplicate_registration",
            Self::UnknownClient => "unknown_client",
            Self::AmbiguousReference => "ambiguous_reference",
            Self::UnresolvedContact => "unresolved_contact",
            Self::UnsupportedCommand => "unsupported_command",
            Self::DispatchTimeout => "dispatch_timeout",
            Self::BackendFailure => "backend_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_str_matches_serde() {
        for kind in [
            ErrorKind::MalformedEnvelope,
            ErrorKind::UnsupportedKind,
            ErrorKind::DuplicateRegistration,
            ErrorKind::UnknownClient,
            ErrorKind::AmbiguousReference,
            ErrorKind::UnresolvedContact,
            ErrorKind::UnsupportedCommand,
            ErrorKind::DispatchTimeout,
            ErrorKind::BackendFailure,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
