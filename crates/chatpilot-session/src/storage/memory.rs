//! In-memory conversation store.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use chatpilot_core::{
    ConversationStore,
    traits::{ConversationId, ConversationInfo, StorageError, StoredMessage},
};

struct Conversation {
    messages: Vec<StoredMessage>,
    updated_at: i64,
}

/// In-memory conversation store.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
}

impl MemoryConversationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn load_conversation(&self, id: &str) -> Result<Vec<StoredMessage>, StorageError> {
        self.conversations
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(id)
            .map(|c| c.messages.clone())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn append_message(&self, id: &str, message: StoredMessage) -> Result<(), StorageError> {
        let mut conversations = self
            .conversations
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let conversation = conversations
            .entry(id.to_string())
            .or_insert_with(|| Conversation {
                messages: Vec::new(),
                updated_at: 0,
            });

        conversation.updated_at = conversation.updated_at.max(message.timestamp);
        conversation.messages.push(message);

        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationInfo>, StorageError> {
        let conversations = self
            .conversations
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<ConversationInfo> = conversations
            .iter()
            .map(|(id, c)| ConversationInfo {
                id: id.clone(),
                message_count: c.messages.len(),
                updated_at: c.updated_at,
            })
            .collect();

        // Most recent first, then by id for a stable listing
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));

        Ok(result)
    }
}
