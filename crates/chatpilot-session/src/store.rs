//! Session state store.
//!
//! One shared [`SessionSnapshot`] per hub plus per-client command history.
//! Every mutation happens under the write lock, so directory swaps and
//! `last_contact` updates are atomic and totally ordered. Readers get owned
//! snapshots and never hold the lock across an await.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chatpilot_core::{Intent, SessionChange, SessionSnapshot};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;

use crate::registry::{ClientId, RegistryEvent};

/// Commands remembered per client.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Result of a session mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    /// What changed.
    pub change: SessionChange,
    /// Session right after the mutation.
    pub snapshot: SessionSnapshot,
}

/// Shared session plus per-client state.
pub struct SessionStore {
    session: RwLock<SessionSnapshot>,
    histories: RwLock<HashMap<ClientId, VecDeque<String>>>,
    history_limit: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::from_snapshot(SessionSnapshot::default())
    }

    /// Create a store starting from an existing session.
    #[must_use]
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            session: RwLock::new(snapshot),
            histories: RwLock::new(HashMap::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Consistent copy of the session.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.session.read().await.clone()
    }

    pub async fn directory_is_empty(&self) -> bool {
        self.session.read().await.contacts.is_empty()
    }

    /// Replace the contact directory wholesale.
    pub async fn replace_directory(&self, contacts: Vec<String>) -> SessionUpdate {
        let mut session = self.session.write().await;
        let change = SessionChange {
            directory: session.replace_directory(contacts),
            ..SessionChange::default()
        };
        if change.directory {
            tracing::info!(count = session.contacts.len(), "Contact directory replaced");
        }
        SessionUpdate {
            change,
            snapshot: session.clone(),
        }
    }

    /// Seed an empty directory. A populated one is left alone.
    pub async fn seed_directory(&self, contacts: Vec<String>) -> SessionUpdate {
        let mut session = self.session.write().await;
        let change = SessionChange {
            directory: session.contacts.is_empty() && session.replace_directory(contacts),
            ..SessionChange::default()
        };
        SessionUpdate {
            change,
            snapshot: session.clone(),
        }
    }

    /// Overwrite the whole session.
    pub async fn replace_snapshot(&self, snapshot: SessionSnapshot) {
        *self.session.write().await = snapshot;
    }

    /// Apply a successfully executed intent.
    pub async fn record_success(&self, intent: &Intent, result: &Value) -> SessionUpdate {
        let mut session = self.session.write().await;
        let change = session.apply_success(intent, result);
        if !change.is_empty() {
            tracing::debug!(action = intent.action(), ?change, "Session updated");
        }
        SessionUpdate {
            change,
            snapshot: session.clone(),
        }
    }

    /// Remember a raw command, keeping only the most recent ones.
    pub async fn push_history(&self, client_id: ClientId, command: &str) {
        if self.history_limit == 0 {
            return;
        }
        let mut histories = self.histories.write().await;
        let history = histories.entry(client_id).or_default();
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(command.to_string());
    }

    /// Commands from a client, oldest first.
    pub async fn history(&self, client_id: ClientId) -> Vec<String> {
        self.histories
            .read()
            .await
            .get(&client_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every piece of per-client state.
    pub async fn forget_client(&self, client_id: ClientId) {
        self.histories.write().await.remove(&client_id);
    }

    /// Follow registry lifecycle events, dropping per-client state on
    /// unregistration.
    pub fn spawn_lifecycle_listener(
        self: Arc<Self>,
        events: broadcast::Receiver<RegistryEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = BroadcastStream::new(events);
            while let Some(event) = stream.next().await {
                match event {
                    Ok(RegistryEvent::Registered { client_id, .. }) => {
                        self.histories.write().await.entry(client_id).or_default();
                    }
                    Ok(RegistryEvent::Unregistered { client_id }) => {
                        self.forget_client(client_id).await;
                    }
                    Err(e) => tracing::warn!("Lifecycle listener lagged: {e}"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::registry::{Connection, ConnectionRegistry};

    #[tokio::test]
    async fn test_record_success_updates_last_contact() {
        let store = SessionStore::from_snapshot(SessionSnapshot::with_contacts(["John", "Sarah"]));
        let update = store
            .record_success(&Intent::send("Sarah", "hi").unwrap(), &Value::Null)
            .await;
        assert!(update.change.last_contact);
        assert_eq!(update.snapshot.last_contact.as_deref(), Some("Sarah"));
        assert_eq!(store.snapshot().await.last_contact.as_deref(), Some("Sarah"));
    }

    #[tokio::test]
    async fn test_list_contacts_replaces_directory() {
        let store = SessionStore::from_snapshot(SessionSnapshot::with_contacts(["Old"]));
        let result = serde_json::json!({ "contacts": ["John", "Sarah"] });
        let update = store.record_success(&Intent::ListContacts, &result).await;
        assert!(update.change.directory);
        assert_eq!(update.snapshot.contacts, vec!["John", "Sarah"]);
    }

    #[tokio::test]
    async fn test_seed_only_fills_empty_directory() {
        let store = SessionStore::new();
        let update = store.seed_directory(vec!["John".into(), "Sarah".into()]).await;
        assert!(update.change.directory);

        let update = store.seed_directory(vec!["Zed".into()]).await;
        assert!(update.change.is_empty());
        assert_eq!(update.snapshot.contacts, vec!["John", "Sarah"]);
        assert_eq!(update.snapshot.last_contact, None);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = SessionStore::new().with_history_limit(3);
        let client = Uuid::new_v4();
        for i in 0..5 {
            store.push_history(client, &format!("cmd {i}")).await;
        }
        assert_eq!(store.history(client).await, vec!["cmd 2", "cmd 3", "cmd 4"]);
    }

    #[tokio::test]
    async fn test_unregister_drops_history() {
        let registry = ConnectionRegistry::<String>::new();
        let store = Arc::new(SessionStore::new());
        let listener = Arc::clone(&store).spawn_lifecycle_listener(registry.subscribe());

        let (tx, _rx) = mpsc::unbounded_channel();
        let client = registry.register(&Connection::new(tx), "a").await.unwrap();
        store.push_history(client, "read john").await;
        assert_eq!(store.history(client).await.len(), 1);

        registry.unregister(client).await;
        let mut cleared = false;
        for _ in 0..50 {
            if store.history(client).await.is_empty() {
                cleared = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cleared);
        listener.abort();
    }
}
