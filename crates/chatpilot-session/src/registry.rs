//! Connection registry.
//!
//! Owns every registered client. Mutations take the write lock, so
//! registrations and removals are totally ordered, and each one is announced
//! on a lifecycle channel the session store listens to.

use std::{collections::HashMap, fmt};

use chatpilot_core::ErrorKind;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

/// Client identifier, stable for the lifetime of a connection.
pub type ClientId = Uuid;

const EVENT_CAPACITY: usize = 256;

/// Identity of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Handle used to push outbound messages to one connection.
#[derive(Debug)]
pub struct Connection<M> {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<M>,
}

impl<M> Clone for Connection<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<M> Connection<M> {
    /// Wrap the sending half of a connection's outbound queue.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<M>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message. Returns false only if the connection's writer is gone.
    pub fn send(&self, msg: M) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub name: String,
    pub connection: ConnectionId,
}

/// Lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered { client_id: ClientId, name: String },
    Unregistered { client_id: ClientId },
}

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Connection {connection} is already registered as {client_id}")]
    DuplicateRegistration {
        connection: ConnectionId,
        client_id: ClientId,
    },
    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),
    #[error("Client {0} disconnected")]
    Disconnected(ClientId),
}

impl RegistryError {
    /// Wire classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateRegistration { .. } => ErrorKind::DuplicateRegistration,
            Self::UnknownClient(_) | Self::Disconnected(_) => ErrorKind::UnknownClient,
        }
    }
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients the message was queued for.
    pub delivered: Vec<ClientId>,
    /// Clients whose connection had gone away; they are now unregistered.
    pub dropped: Vec<ClientId>,
}

struct Entry<M> {
    info: ClientInfo,
    connection: Connection<M>,
}

struct Inner<M> {
    /// Registration order; broadcasts follow it.
    order: Vec<ClientId>,
    entries: HashMap<ClientId, Entry<M>>,
}

/// Registry of live, registered connections.
pub struct ConnectionRegistry<M> {
    inner: RwLock<Inner<M>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl<M: Clone> Default for ConnectionRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Clone> ConnectionRegistry<M> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                order: Vec::new(),
                entries: HashMap::new(),
            }),
            events,
        }
    }

    /// Subscribe to registration lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a connection under a fresh client id.
    ///
    /// # Errors
    /// Returns `DuplicateRegistration` if the connection is already
    /// registered; the existing entry is left untouched.
    pub async fn register(
        &self,
        connection: &Connection<M>,
        declared_name: &str,
    ) -> Result<ClientId, RegistryError> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner
            .entries
            .values()
            .find(|e| e.info.connection == connection.id())
        {
            return Err(RegistryError::DuplicateRegistration {
                connection: connection.id(),
                client_id: existing.info.id,
            });
        }

        let client_id = Uuid::new_v4();
        let name = declared_name.trim().to_string();
        inner.order.push(client_id);
        inner.entries.insert(
            client_id,
            Entry {
                info: ClientInfo {
                    id: client_id,
                    name: name.clone(),
                    connection: connection.id(),
                },
                connection: connection.clone(),
            },
        );

        // Announced under the lock so listeners see the same order as the registry.
        let _ = self.events.send(RegistryEvent::Registered { client_id, name });
        tracing::info!(%client_id, name = declared_name, "Client registered");
        Ok(client_id)
    }

    /// Remove a client. Removing an unknown client is a no-op.
    pub async fn unregister(&self, client_id: ClientId) -> Option<ClientInfo> {
        let mut inner = self.inner.write().await;
        let entry = inner.entries.remove(&client_id)?;
        inner.order.retain(|id| *id != client_id);

        let _ = self.events.send(RegistryEvent::Unregistered { client_id });
        tracing::info!(%client_id, name = %entry.info.name, "Client unregistered");
        Some(entry.info)
    }

    /// Connection handle for a client.
    ///
    /// # Errors
    /// Returns `UnknownClient` if the client is not registered.
    pub async fn lookup(&self, client_id: ClientId) -> Result<Connection<M>, RegistryError> {
        self.inner
            .read()
            .await
            .entries
            .get(&client_id)
            .map(|e| e.connection.clone())
            .ok_or(RegistryError::UnknownClient(client_id))
    }

    /// Registered client's details.
    pub async fn info(&self, client_id: ClientId) -> Option<ClientInfo> {
        self.inner
            .read()
            .await
            .entries
            .get(&client_id)
            .map(|e| e.info.clone())
    }

    /// Client registered for a connection, if any.
    pub async fn client_for(&self, connection: ConnectionId) -> Option<ClientId> {
        self.inner
            .read()
            .await
            .entries
            .values()
            .find(|e| e.info.connection == connection)
            .map(|e| e.info.id)
    }

    /// Send to a single client.
    ///
    /// # Errors
    /// Returns `UnknownClient` if not registered, `Disconnected` if the
    /// connection has gone away (the client is unregistered).
    pub async fn send_to(&self, client_id: ClientId, msg: M) -> Result<(), RegistryError> {
        let connection = self.lookup(client_id).await?;
        if connection.send(msg) {
            return Ok(());
        }
        tracing::warn!(%client_id, "Send failed, dropping client");
        self.unregister(client_id).await;
        Err(RegistryError::Disconnected(client_id))
    }

    /// Best-effort send to every registered client except `exclude`, in
    /// registration order.
    ///
    /// A failing client does not block the others; it is unregistered.
    pub async fn broadcast(&self, msg: &M, exclude: Option<ClientId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        {
            let inner = self.inner.read().await;
            for client_id in &inner.order {
                if Some(*client_id) == exclude {
                    continue;
                }
                let Some(entry) = inner.entries.get(client_id) else {
                    continue;
                };
                if entry.connection.send(msg.clone()) {
                    report.delivered.push(*client_id);
                } else {
                    report.dropped.push(*client_id);
                }
            }
        }

        for client_id in &report.dropped {
            tracing::warn!(%client_id, "Broadcast failed, dropping client");
            self.unregister(*client_id).await;
        }
        report
    }

    /// Registered clients in registration order.
    pub async fn clients(&self) -> Vec<ClientInfo> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).map(|e| e.info.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Connection<String>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(tx), rx)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = connection();

        let id = registry.register(&conn, "laptop").await.unwrap();
        assert_eq!(registry.info(id).await.unwrap().name, "laptop");
        assert_eq!(registry.client_for(conn.id()).await, Some(id));

        registry.send_to(id, "hello".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));

        let unknown = Uuid::new_v4();
        assert_eq!(
            registry.lookup(unknown).await.unwrap_err(),
            RegistryError::UnknownClient(unknown)
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_entry() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection();

        let id = registry.register(&conn, "first").await.unwrap();
        let err = registry.register(&conn, "second").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateRegistration);

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.info(id).await.unwrap().name, "first");
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::<String>::new();
        let (conn, _rx) = connection();
        let mut events = registry.subscribe();

        let id = registry.register(&conn, "phone").await.unwrap();
        assert!(registry.unregister(id).await.is_some());
        assert!(registry.unregister(id).await.is_none());
        assert!(registry.is_empty().await);

        assert!(matches!(events.recv().await, Ok(RegistryEvent::Registered { .. })));
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Unregistered { client_id: id }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_order_and_exclusion() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = connection();
        let (b, mut rx_b) = connection();
        let (c, mut rx_c) = connection();

        let id_a = registry.register(&a, "a").await.unwrap();
        let id_b = registry.register(&b, "b").await.unwrap();
        let id_c = registry.register(&c, "c").await.unwrap();

        let report = registry.broadcast(&"update".to_string(), Some(id_a)).await;
        assert_eq!(report.delivered, vec![id_b, id_c]);
        assert!(report.dropped.is_empty());

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), "update");
        assert_eq!(rx_c.try_recv().unwrap(), "update");
    }

    #[tokio::test]
    async fn test_broadcast_drops_dead_client() {
        let registry = ConnectionRegistry::new();
        let (a, rx_a) = connection();
        let (b, mut rx_b) = connection();

        let id_a = registry.register(&a, "a").await.unwrap();
        let id_b = registry.register(&b, "b").await.unwrap();
        drop(rx_a);

        let report = registry.broadcast(&"ping".to_string(), None).await;
        assert_eq!(report.delivered, vec![id_b]);
        assert_eq!(report.dropped, vec![id_a]);
        assert_eq!(rx_b.try_recv().unwrap(), "ping");

        let clients = registry.clients().await;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].id, id_b);

        let err = registry.send_to(id_a, "late".to_string()).await.unwrap_err();
        assert_eq!(err, RegistryError::UnknownClient(id_a));
    }
}
