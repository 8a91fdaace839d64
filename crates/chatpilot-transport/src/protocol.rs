//! Wire protocol for client-hub communication.
//!
//! Every frame is one JSON object: a `kind` tag, an optional `correlation_id`
//! and the kind's fields at the top level.

use chatpilot_core::{ErrorKind, IntentHint, SessionSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Returned by [`encode`] if serialization ever fails.
const ENCODE_FALLBACK: &str =
    r#"{"kind":"error","error_kind":"malformed_envelope","message":"failed to encode envelope"}"#;

/// Client-supplied hints attached to a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandContext {
    /// Client's view of the directory; only seeds an empty session directory.
    pub contact_list: Option<Vec<String>>,
    /// Client's last contact; only read while interpreting this command, and
    /// only when the session has none.
    pub last_contact: Option<String>,
}

/// Envelope payload, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    // Client to hub.
    /// Registration handshake.
    Register { client_name: String },
    /// Natural-language command.
    Command {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<CommandContext>,
    },
    /// Pre-structured command; skips the language model.
    DirectCommand { structured_action: IntentHint },
    /// Free-form language model request.
    AiRequest {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    /// Client pushes its contact directory.
    ContactListUpdate { contacts: Vec<String> },
    /// Ask for the current session.
    SnapshotRequest {},
    /// Keepalive.
    Ping {},

    // Hub to client.
    RegistrationConfirmed { client_id: String },
    Response {
        response_type: String,
        content: Value,
        success: bool,
    },
    ContactListBroadcast {
        contacts: Vec<String>,
        total_count: usize,
    },
    SessionUpdate {
        last_contact: Option<String>,
        active_conversation: Option<String>,
        auto_reply: bool,
    },
    Pong {},
    Error { error_kind: ErrorKind, message: String },
}

impl Payload {
    /// Wire name of the kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Command { .. } => "command",
            Self::DirectCommand { .. } => "direct_command",
            Self::AiRequest { .. } => "ai_request",
            Self::ContactListUpdate { .. } => "contact_list_update",
            Self::SnapshotRequest {} => "snapshot_request",
            Self::Ping {} => "ping",
            Self::RegistrationConfirmed { .. } => "registration_confirmed",
            Self::Response { .. } => "response",
            Self::ContactListBroadcast { .. } => "contact_list_broadcast",
            Self::SessionUpdate { .. } => "session_update",
            Self::Pong {} => "pong",
            Self::Error { .. } => "error",
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Set by a requester, echoed verbatim by the answer. Broadcasts carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Envelope without a correlation id.
    #[must_use]
    pub const fn new(payload: Payload) -> Self {
        Self {
            correlation_id: None,
            payload,
        }
    }

    /// Envelope answering a request.
    #[must_use]
    pub const fn reply(correlation_id: Option<String>, payload: Payload) -> Self {
        Self {
            correlation_id,
            payload,
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn error(correlation_id: Option<String>, error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::reply(
            correlation_id,
            Payload::Error {
                error_kind,
                message: message.into(),
            },
        )
    }

    #[must_use]
    pub fn response(
        correlation_id: Option<String>,
        response_type: impl Into<String>,
        content: Value,
        success: bool,
    ) -> Self {
        Self::reply(
            correlation_id,
            Payload::Response {
                response_type: response_type.into(),
                content,
                success,
            },
        )
    }

    /// Session fields broadcast after a state change.
    #[must_use]
    pub fn session_update(snapshot: &SessionSnapshot) -> Self {
        Self::new(Payload::SessionUpdate {
            last_contact: snapshot.last_contact.clone(),
            active_conversation: snapshot.active_conversation.clone(),
            auto_reply: snapshot.auto_reply,
        })
    }

    /// Directory preview: the first `limit` contacts plus the full count.
    #[must_use]
    pub fn contact_list(contacts: &[String], limit: usize) -> Self {
        Self::new(Payload::ContactListBroadcast {
            contacts: contacts.iter().take(limit).cloned().collect(),
            total_count: contacts.len(),
        })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// Protocol error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed envelope: {message}")]
pub struct ProtocolError {
    /// Correlation id recovered from the raw frame, if any.
    pub correlation_id: Option<String>,
    pub message: String,
}

impl ProtocolError {
    /// Wire classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedEnvelope
    }

    /// Error envelope answering the bad frame.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        Envelope::error(self.correlation_id.clone(), self.kind(), self.message.clone())
    }
}

/// Decode a text frame.
///
/// # Errors
/// Returns error on invalid JSON, an unknown `kind` or missing fields. The
/// error keeps the frame's `correlation_id` when one can be read.
pub fn decode(raw: &str) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolError {
        correlation_id: None,
        message: format!("invalid JSON: {e}"),
    })?;

    let correlation_id = value
        .get("correlation_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    serde_json::from_value(value).map_err(|e| ProtocolError {
        correlation_id,
        message: e.to_string(),
    })
}

/// Decode a binary frame holding UTF-8 JSON.
///
/// # Errors
/// Returns error if the bytes are not UTF-8 or do not decode.
pub fn decode_bytes(raw: &[u8]) -> Result<Envelope, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|e| ProtocolError {
        correlation_id: None,
        message: format!("frame is not UTF-8: {e}"),
    })?;
    decode(text)
}

/// Encode an envelope. Never fails.
#[must_use]
pub fn encode(envelope: &Envelope) -> String {
    serde_json::to_string(envelope).unwrap_or_else(|e| {
        tracing::error!(kind = envelope.kind(), "Failed to serialize envelope: {e}");
        ENCODE_FALLBACK.to_string()
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_command_with_context() {
        let env = decode(
            r#"{"kind":"command","correlation_id":"c-1","text":"tell her hi","context":{"last_contact":"Sarah"}}"#,
        )
        .unwrap();
        assert_eq!(env.correlation_id.as_deref(), Some("c-1"));
        let Payload::Command { text, context } = env.payload else {
            panic!("expected command, got {}", env.payload.kind());
        };
        assert_eq!(text, "tell her hi");
        assert_eq!(context.unwrap().last_contact.as_deref(), Some("Sarah"));
    }

    #[test]
    fn test_decode_empty_payload_kinds() {
        assert_eq!(decode(r#"{"kind":"ping"}"#).unwrap().payload, Payload::Ping {});
        assert_eq!(
            decode(r#"{"kind":"snapshot_request","correlation_id":"s"}"#).unwrap(),
            Envelope::reply(Some("s".into()), Payload::SnapshotRequest {})
        );
    }

    #[test]
    fn test_direct_command_accepts_field_aliases() {
        let env = decode(
            r#"{"kind":"direct_command","structured_action":{"action":"send","to":"Mike","text":"hi"}}"#,
        )
        .unwrap();
        let Payload::DirectCommand { structured_action } = env.payload else {
            panic!("expected direct_command");
        };
        assert_eq!(structured_action.contact.as_deref(), Some("Mike"));
        assert_eq!(structured_action.message.as_deref(), Some("hi"));
    }

    #[test]
    fn test_malformed_keeps_correlation_id() {
        let err = decode(r#"{"kind":"teleport","correlation_id":"x-9"}"#).unwrap_err();
        assert_eq!(err.correlation_id.as_deref(), Some("x-9"));
        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);

        let err = decode(r#"{"kind":"command","correlation_id":"x-10"}"#).unwrap_err();
        assert_eq!(err.correlation_id.as_deref(), Some("x-10"));

        let err = decode("not json").unwrap_err();
        assert_eq!(err.correlation_id, None);

        let err = decode_bytes(&[0xff, 0xfe]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
    }

    #[test]
    fn test_encode_shapes() {
        let env = Envelope::error(Some("c-2".into()), ErrorKind::UnknownClient, "register first");
        let value: Value = serde_json::from_str(&encode(&env)).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "error",
                "correlation_id": "c-2",
                "error_kind": "unknown_client",
                "message": "register first",
            })
        );

        let broadcast = Envelope::contact_list(&["A".into(), "B".into(), "C".into()], 2);
        let value: Value = serde_json::from_str(&encode(&broadcast)).unwrap();
        assert_eq!(value["contacts"], json!(["A", "B"]));
        assert_eq!(value["total_count"], 3);
        assert!(value.get("correlation_id").is_none());
    }
}
