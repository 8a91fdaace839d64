//! Structured intents and the untrusted hints they are built from.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a `summarize` intent points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryTarget {
    /// The chat with a directory contact.
    Contact(String),
    /// A stored conversation by id.
    Conversation(String),
}

/// Validated, structured representation of a user command.
///
/// Each variant carries only the fields relevant to it. Construct through the
/// checked constructors; a value that fails [`Intent::validate`] is never
/// dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Intent {
    /// Send a message to a contact.
    Send { contact: String, message: String },
    /// Read recent messages from a contact.
    Read { contact: String },
    /// Summarize a chat or stored conversation.
    Summarize { target: SummaryTarget },
    /// Suggest replies for a chat.
    SuggestReply { contact: String },
    /// Toggle automatic replies.
    SetAutoReply { enabled: bool },
    /// Refresh the contact directory.
    ListContacts,
}

/// Intent validation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntentError {
    #[error("{action} requires a contact")]
    MissingContact { action: &'static str },
    #[error("send requires a non-empty message")]
    EmptyMessage,
    #[error("summarize requires a conversation id")]
    MissingConversation,
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

impl Intent {
    /// Build a `send` intent.
    ///
    /// # Errors
    /// Returns error if contact or message is blank.
    pub fn send(contact: impl Into<String>, message: impl Into<String>) -> Result<Self, IntentError> {
        let intent = Self::Send {
            contact: contact.into(),
            message: message.into(),
        };
        intent.validate()?;
        Ok(intent)
    }

    /// Build a `read` intent.
    ///
    /// # Errors
    /// Returns error if contact is blank.
    pub fn read(contact: impl Into<String>) -> Result<Self, IntentError> {
        let intent = Self::Read {
            contact: contact.into(),
        };
        intent.validate()?;
        Ok(intent)
    }

    /// Build a `summarize` intent for a contact's chat.
    ///
    /// # Errors
    /// Returns error if contact is blank.
    pub fn summarize_contact(contact: impl Into<String>) -> Result<Self, IntentError> {
        let intent = Self::Summarize {
            target: SummaryTarget::Contact(contact.into()),
        };
        intent.validate()?;
        Ok(intent)
    }

    /// Build a `summarize` intent for a stored conversation.
    ///
    /// # Errors
    /// Returns error if the conversation id is blank.
    pub fn summarize_conversation(id: impl Into<String>) -> Result<Self, IntentError> {
        let intent = Self::Summarize {
            target: SummaryTarget::Conversation(id.into()),
        };
        intent.validate()?;
        Ok(intent)
    }

    /// Build a `suggest_reply` intent.
    ///
    /// # Errors
    /// Returns error if contact is blank.
    pub fn suggest_reply(contact: impl Into<String>) -> Result<Self, IntentError> {
        let intent = Self::SuggestReply {
            contact: contact.into(),
        };
        intent.validate()?;
        Ok(intent)
    }

    /// Build a `set_auto_reply` intent.
    #[must_use]
    pub const fn set_auto_reply(enabled: bool) -> Self {
        Self::SetAutoReply { enabled }
    }

    /// Check that every field the variant needs is present.
    ///
    /// # Errors
    /// Returns the first missing or blank field.
    pub fn validate(&self) -> Result<(), IntentError> {
        let action = self.action();
        match self {
            Self::Send { contact, message } => {
                non_empty(contact).ok_or(IntentError::MissingContact { action })?;
                non_empty(message).ok_or(IntentError::EmptyMessage)?;
            }
            Self::Read { contact } | Self::SuggestReply { contact } => {
                non_empty(contact).ok_or(IntentError::MissingContact { action })?;
            }
            Self::Summarize { target } => match target {
                SummaryTarget::Contact(contact) => {
                    non_empty(contact).ok_or(IntentError::MissingContact { action })?;
                }
                SummaryTarget::Conversation(id) => {
                    non_empty(id).ok_or(IntentError::MissingConversation)?;
                }
            },
            Self::SetAutoReply { .. } | Self::ListContacts => {}
        }
        Ok(())
    }

    /// Wire name of the action.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Read { .. } => "read",
            Self::Summarize { .. } => "summarize",
            Self::SuggestReply { .. } => "suggest_reply",
            Self::SetAutoReply { .. } => "set_auto_reply",
            Self::ListContacts => "list_contacts",
        }
    }

    /// The directory contact this intent addresses, if any.
    #[must_use]
    pub fn contact(&self) -> Option<&str> {
        match self {
            Self::Send { contact, .. }
            | Self::Read { contact }
            | Self::SuggestReply { contact }
            | Self::Summarize {
                target: SummaryTarget::Contact(contact),
            } => Some(contact),
            _ => None,
        }
    }
}

/// Best-effort structured guess returned by a language model.
///
/// Every field is optional and untrusted; the interpreter revalidates all of
/// them before an [`Intent`] is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentHint {
    /// Free-form action name ("send", "summary", "auto_on", ...).
    pub action: Option<String>,
    /// Contact as written by the user, possibly a pronoun.
    #[serde(alias = "name", alias = "to")]
    pub contact: Option<String>,
    /// Message body for `send`.
    #[serde(alias = "text", alias = "body")]
    pub message: Option<String>,
    /// Auto-reply flag.
    pub enabled: Option<bool>,
    /// Stored conversation id for `summarize`.
    #[serde(alias = "conversation_id")]
    pub conversation: Option<String>,
}

impl IntentHint {
    /// Hint with only an action.
    #[must_use]
    pub fn action(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Self::default()
        }
    }

    /// Set the contact.
    #[must_use]
    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    /// Set the message body.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the auto-reply flag.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Set the conversation id.
    #[must_use]
    pub fn with_conversation(mut self, conversation: impl Into<String>) -> Self {
        self.conversation = Some(conversation.into());
        self
    }
}
