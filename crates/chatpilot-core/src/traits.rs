//! Collaborator traits: automation backend, language model, conversation store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::intent::{Intent, IntentHint};

/// Conversation identifier used by the store.
pub type ConversationId = String;

/// Backend failure, classified by the backend itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    /// Human-readable reason.
    pub message: String,
    /// Whether retrying the same intent may succeed.
    pub retryable: bool,
}

impl BackendError {
    /// Failure worth retrying (flaky page, lost element, busy browser).
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure that will not go away on retry.
    #[must_use]
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Trait for automation backends that drive the messaging client.
///
/// The hub treats the backend as a black box; it only knows how to hand it a
/// validated [`Intent`] and read back a JSON result.
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    /// Execute an intent.
    async fn execute(&self, intent: &Intent) -> Result<Value, BackendError>;
}

/// Language model error.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model unavailable: {0}")]
    Unavailable(String),
    #[error("Model request failed: {0}")]
    RequestFailed(String),
    #[error("Model output could not be parsed: {0}")]
    InvalidOutput(String),
}

/// Trait for language model collaborators.
///
/// Outputs are hints. Nothing returned here is trusted without revalidation.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Turn a raw command into a structured guess.
    ///
    /// `context` is the snippet built by [`crate::SessionSnapshot::context_snippet`].
    async fn parse_command(&self, text: &str, context: &Value) -> Result<IntentHint, ModelError>;

    /// Summarize conversation text.
    async fn summarize(&self, conversation: &str) -> Result<String, ModelError>;

    /// Suggest replies for conversation text.
    async fn suggest_reply(&self, conversation: &str) -> Result<String, ModelError>;

    /// Free-form generation for `ai_request` passthrough.
    async fn generate(&self, prompt: &str, context: Option<&str>) -> Result<String, ModelError>;
}

/// Stored chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Sender name ("me" for outgoing).
    pub sender: String,
    /// Message text.
    pub content: String,
    /// Creation timestamp (Unix epoch seconds).
    pub timestamp: i64,
}

/// Conversation summary returned by listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: ConversationId,
    pub message_count: usize,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Conversation not found: {0}")]
    NotFound(ConversationId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for conversation storage backends.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load every message of a conversation, oldest first.
    async fn load_conversation(&self, id: &str) -> Result<Vec<StoredMessage>, StorageError>;

    /// Append a message, creating the conversation if needed.
    async fn append_message(&self, id: &str, message: StoredMessage) -> Result<(), StorageError>;

    /// List conversations, most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<ConversationInfo>, StorageError>;
}
