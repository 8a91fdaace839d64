//! In-process stand-in for a browser-driven messaging client.

use std::collections::HashMap;

use async_trait::async_trait;
use chatpilot_core::{AutomationBackend, BackendError, Intent, SummaryTarget};
use serde_json::{Value, json};
use tokio::sync::RwLock;

const READ_LIMIT: usize = 10;

#[derive(Debug, Clone)]
struct Message {
    sender: String,
    content: String,
}

impl Message {
    fn new(sender: &str, content: &str) -> Self {
        Self {
            sender: sender.to_string(),
            content: content.to_string(),
        }
    }

    fn to_json(&self) -> Value {
        json!({ "sender": self.sender, "content": self.content })
    }
}

/// Canned chats for a fixed set of contacts.
pub struct SimulatedBackend {
    contacts: Vec<String>,
    chats: RwLock<HashMap<String, Vec<Message>>>,
}

impl SimulatedBackend {
    #[must_use]
    pub fn new() -> Self {
        let seed = [
            ("John", "Are we still on for tonight?"),
            ("Sarah", "Lunch tomorrow?"),
            ("Mike", "Thanks for the help earlier"),
            ("Emma", "Did you see the new schedule?"),
            ("David", "Call me when you're free"),
        ];
        let chats = seed
            .iter()
            .map(|(name, text)| ((*name).to_string(), vec![Message::new(name, text)]))
            .collect();
        Self {
            contacts: seed.iter().map(|(name, _)| (*name).to_string()).collect(),
            chats: RwLock::new(chats),
        }
    }

    fn chat_name(&self, contact: &str) -> Result<String, BackendError> {
        self.contacts
            .iter()
            .find(|c| c.eq_ignore_ascii_case(contact))
            .cloned()
            .ok_or_else(|| BackendError::terminal(format!("No chat found for '{contact}'")))
    }

    async fn recent(&self, contact: &str) -> Result<Value, BackendError> {
        let name = self.chat_name(contact)?;
        let chats = self.chats.read().await;
        let messages = chats.get(&name).map_or(&[][..], Vec::as_slice);
        let start = messages.len().saturating_sub(READ_LIMIT);
        let messages: Vec<Value> = messages[start..].iter().map(Message::to_json).collect();
        Ok(json!({ "contact": name, "messages": messages }))
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AutomationBackend for SimulatedBackend {
    async fn execute(&self, intent: &Intent) -> Result<Value, BackendError> {
        tracing::debug!(action = intent.action(), "Simulated backend executing");
        match intent {
            Intent::ListContacts => Ok(json!({ "contacts": self.contacts })),
            Intent::Send { contact, message } => {
                let name = self.chat_name(contact)?;
                self.chats
                    .write()
                    .await
                    .entry(name.clone())
                    .or_default()
                    .push(Message::new("me", message));
                Ok(json!({ "status": "sent", "contact": name, "message": message }))
            }
            Intent::Read { contact }
            | Intent::SuggestReply { contact }
            | Intent::Summarize {
                target: SummaryTarget::Contact(contact),
            } => self.recent(contact).await,
            Intent::Summarize {
                target: SummaryTarget::Conversation(id),
            } => Err(BackendError::terminal(format!("Conversation '{id}' is not open in the client"))),
            Intent::SetAutoReply { enabled } => Ok(json!({ "auto_reply": enabled })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lists_seeded_contacts() {
        let backend = SimulatedBackend::new();
        let result = backend.execute(&Intent::ListContacts).await.unwrap();
        assert_eq!(result["contacts"], json!(["John", "Sarah", "Mike", "Emma", "David"]));
    }

    #[tokio::test]
    async fn test_sent_message_shows_up_in_read() {
        let backend = SimulatedBackend::new();
        let sent = backend
            .execute(&Intent::send("sarah", "Sure, noon?").unwrap())
            .await
            .unwrap();
        assert_eq!(sent["contact"], "Sarah");

        let read = backend.execute(&Intent::read("Sarah").unwrap()).await.unwrap();
        let messages = read["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["sender"], "me");
        assert_eq!(messages[1]["content"], "Sure, noon?");
    }

    #[tokio::test]
    async fn test_unknown_chat_is_terminal() {
        let backend = SimulatedBackend::new();
        let err = backend.execute(&Intent::read("Zed").unwrap()).await.unwrap_err();
        assert!(!err.retryable);
    }
}
