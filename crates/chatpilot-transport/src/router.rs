//! Message router.
//!
//! The [`Hub`] decodes inbound frames, routes each kind to exactly one
//! handler and shapes every outcome into a correlated reply or a broadcast.
//! Registration, pings and snapshot reads are answered inline; commands and
//! model requests run on their own task so a slow backend never stalls the
//! connection's read loop.

use std::{sync::Arc, time::Duration};

use chatpilot_core::{
    AutomationBackend, ConversationStore, ErrorKind, HubConfig, Intent, IntentHint, LanguageModel,
    SessionSnapshot,
};
use chatpilot_interpreter::{InterpretError, Interpreter};
use chatpilot_session::{
    ClientId, Connection, ConnectionRegistry, DispatchCoordinator, DispatchError, DispatchOutcome,
    SessionStore,
};
use serde_json::{Value, json};

use crate::protocol::{CommandContext, Envelope, Payload, ProtocolError, decode, decode_bytes};

/// Per-connection routing state.
pub struct ConnectionContext {
    connection: Connection<Envelope>,
    client_id: Option<ClientId>,
}

impl ConnectionContext {
    #[must_use]
    pub const fn new(connection: Connection<Envelope>) -> Self {
        Self {
            connection,
            client_id: None,
        }
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection<Envelope> {
        &self.connection
    }

    /// Client id, once registered.
    #[must_use]
    pub const fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// Queue a reply on this connection only.
    fn reply(&self, envelope: Envelope) {
        if !self.connection.send(envelope) {
            tracing::debug!(connection = %self.connection.id(), "Reply dropped, connection closed");
        }
    }
}

/// Builder for [`Hub`].
pub struct HubBuilder {
    config: HubConfig,
    backend: Arc<dyn AutomationBackend>,
    model: Arc<dyn LanguageModel>,
    session: SessionSnapshot,
    conversations: Option<Arc<dyn ConversationStore>>,
}

impl HubBuilder {
    #[must_use]
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial session state.
    #[must_use]
    pub fn session(mut self, snapshot: SessionSnapshot) -> Self {
        self.session = snapshot;
        self
    }

    #[must_use]
    pub fn conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(store);
        self
    }

    /// Assemble the hub and start its session lifecycle listener.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn build(self) -> Arc<Hub> {
        let registry = Arc::new(ConnectionRegistry::new());
        let session = Arc::new(SessionStore::from_snapshot(self.session));
        Arc::clone(&session).spawn_lifecycle_listener(registry.subscribe());

        let interpreter = Interpreter::from_config(Arc::clone(&self.model), &self.config);
        let mut dispatcher = DispatchCoordinator::from_config(self.backend, Arc::clone(&session), &self.config)
            .with_model(Arc::clone(&self.model));
        if let Some(store) = self.conversations {
            dispatcher = dispatcher.with_conversation_store(store);
        }

        Arc::new(Hub {
            registry,
            session,
            interpreter,
            dispatcher,
            model: self.model,
            model_timeout: self.config.model_timeout(),
            idle_timeout: self.config.idle_timeout(),
            broadcast_limit: self.config.broadcast_contact_limit,
        })
    }
}

/// Central coordinator shared by every connection.
pub struct Hub {
    registry: Arc<ConnectionRegistry<Envelope>>,
    session: Arc<SessionStore>,
    interpreter: Interpreter,
    dispatcher: DispatchCoordinator,
    model: Arc<dyn LanguageModel>,
    model_timeout: Duration,
    idle_timeout: Duration,
    broadcast_limit: usize,
}

impl Hub {
    /// Start building a hub around a backend and a language model.
    #[must_use]
    pub fn builder(backend: Arc<dyn AutomationBackend>, model: Arc<dyn LanguageModel>) -> HubBuilder {
        HubBuilder {
            config: HubConfig::default(),
            backend,
            model,
            session: SessionSnapshot::default(),
            conversations: None,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry<Envelope>> {
        &self.registry
    }

    #[must_use]
    pub const fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    /// Silence after which a connection is dropped.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Decode and route a text frame.
    pub async fn handle_text(self: &Arc<Self>, ctx: &mut ConnectionContext, raw: &str) {
        match decode(raw) {
            Ok(envelope) => self.route(envelope, ctx).await,
            Err(e) => Self::reject(ctx, &e),
        }
    }

    /// Decode and route a binary frame.
    pub async fn handle_bytes(self: &Arc<Self>, ctx: &mut ConnectionContext, raw: &[u8]) {
        match decode_bytes(raw) {
            Ok(envelope) => self.route(envelope, ctx).await,
            Err(e) => Self::reject(ctx, &e),
        }
    }

    fn reject(ctx: &ConnectionContext, error: &ProtocolError) {
        tracing::warn!(
            connection = %ctx.connection.id(),
            correlation_id = error.correlation_id.as_deref(),
            "Rejected frame: {}",
            error.message
        );
        ctx.reply(error.to_envelope());
    }

    /// Route a decoded envelope to its handler.
    pub async fn route(self: &Arc<Self>, envelope: Envelope, ctx: &mut ConnectionContext) {
        let Envelope {
            correlation_id,
            payload,
        } = envelope;
        tracing::debug!(
            client_id = ?ctx.client_id,
            kind = payload.kind(),
            correlation_id = correlation_id.as_deref(),
            "Routing envelope"
        );

        match payload {
            Payload::Ping {} => ctx.reply(Envelope::reply(correlation_id, Payload::Pong {})),
            Payload::Register { client_name } => self.handle_register(ctx, correlation_id, &client_name).await,
            Payload::Command { text, context } => {
                let Some(client_id) = Self::require_client(ctx, correlation_id.as_deref()) else {
                    return;
                };
                let hub = Arc::clone(self);
                let connection = ctx.connection.clone();
                tokio::spawn(async move {
                    let reply = hub.handle_command(client_id, correlation_id, &text, context).await;
                    connection.send(reply);
                });
            }
            Payload::DirectCommand { structured_action } => {
                let Some(client_id) = Self::require_client(ctx, correlation_id.as_deref()) else {
                    return;
                };
                let hub = Arc::clone(self);
                let connection = ctx.connection.clone();
                tokio::spawn(async move {
                    let reply = hub
                        .handle_direct_command(client_id, correlation_id, &structured_action)
                        .await;
                    connection.send(reply);
                });
            }
            Payload::AiRequest { prompt, context } => {
                if Self::require_client(ctx, correlation_id.as_deref()).is_none() {
                    return;
                }
                let hub = Arc::clone(self);
                let connection = ctx.connection.clone();
                tokio::spawn(async move {
                    let reply = hub.handle_ai_request(correlation_id, &prompt, context.as_ref()).await;
                    connection.send(reply);
                });
            }
            Payload::ContactListUpdate { contacts } => {
                let Some(client_id) = Self::require_client(ctx, correlation_id.as_deref()) else {
                    return;
                };
                let reply = self.handle_contact_list_update(client_id, correlation_id, contacts).await;
                ctx.reply(reply);
            }
            Payload::SnapshotRequest {} => {
                if Self::require_client(ctx, correlation_id.as_deref()).is_none() {
                    return;
                }
                let snapshot = self.session.snapshot().await;
                let content = serde_json::to_value(&snapshot).unwrap_or(Value::Null);
                ctx.reply(Envelope::response(correlation_id, "session_snapshot", content, true));
            }
            other @ (Payload::RegistrationConfirmed { .. }
            | Payload::Response { .. }
            | Payload::ContactListBroadcast { .. }
            | Payload::SessionUpdate { .. }
            | Payload::Pong {}
            | Payload::Error { .. }) => {
                ctx.reply(Envelope::error(
                    correlation_id,
                    ErrorKind::UnsupportedKind,
                    format!("'{}' is not accepted by the hub", other.kind()),
                ));
            }
        }
    }

    /// Drop the connection's registration, if any.
    pub async fn disconnect(&self, ctx: &ConnectionContext) {
        if let Some(client_id) = ctx.client_id {
            self.registry.unregister(client_id).await;
        }
    }

    fn require_client(ctx: &ConnectionContext, correlation_id: Option<&str>) -> Option<ClientId> {
        if ctx.client_id.is_none() {
            ctx.reply(Envelope::error(
                correlation_id.map(str::to_string),
                ErrorKind::UnknownClient,
                "register before sending requests",
            ));
        }
        ctx.client_id
    }

    async fn handle_register(
        self: &Arc<Self>,
        ctx: &mut ConnectionContext,
        correlation_id: Option<String>,
        client_name: &str,
    ) {
        let client_id = match self.registry.register(&ctx.connection, client_name).await {
            Ok(id) => id,
            Err(e) => {
                ctx.reply(Envelope::error(correlation_id, e.kind(), e.to_string()));
                return;
            }
        };
        ctx.client_id = Some(client_id);
        ctx.reply(Envelope::reply(
            correlation_id,
            Payload::RegistrationConfirmed {
                client_id: client_id.to_string(),
            },
        ));

        if self.session.directory_is_empty().await {
            let hub = Arc::clone(self);
            tokio::spawn(async move { hub.refresh_directory(client_id).await });
        }
    }

    /// Fetch the directory from the backend and broadcast it to everyone.
    async fn refresh_directory(&self, client_id: ClientId) {
        match self.dispatcher.dispatch(&Intent::ListContacts, client_id).await {
            Ok(outcome) if outcome.update.change.directory => {
                let envelope = Envelope::contact_list(&outcome.update.snapshot.contacts, self.broadcast_limit);
                self.registry.broadcast(&envelope, None).await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(%client_id, kind = %e.kind(), "Directory refresh failed: {e}"),
        }
    }

    async fn handle_command(
        &self,
        client_id: ClientId,
        correlation_id: Option<String>,
        text: &str,
        context: Option<CommandContext>,
    ) -> Envelope {
        self.session.push_history(client_id, text).await;
        let (contact_list, last_contact) = context.map_or((None, None), |c| (c.contact_list, c.last_contact));

        let snapshot = self
            .session
            .snapshot()
            .await
            .with_client_context(contact_list.as_deref(), last_contact.as_deref());
        let reply = match self.interpreter.interpret(text, &snapshot).await {
            Ok(intent) => self.execute(client_id, correlation_id, intent).await,
            Err(e) => return Self::interpret_failure(client_id, correlation_id, &e),
        };

        if let (Some(contacts), Payload::Response { success: true, .. }) = (contact_list, &reply.payload) {
            self.seed_directory(client_id, contacts).await;
        }
        reply
    }

    /// Adopt a client's directory once one of its commands went through.
    async fn seed_directory(&self, client_id: ClientId, contacts: Vec<String>) {
        let update = self.session.seed_directory(contacts).await;
        if update.change.directory {
            tracing::info!(%client_id, count = update.snapshot.contacts.len(), "Directory seeded from client");
            let envelope = Envelope::contact_list(&update.snapshot.contacts, self.broadcast_limit);
            self.registry.broadcast(&envelope, Some(client_id)).await;
        }
    }

    async fn handle_direct_command(
        &self,
        client_id: ClientId,
        correlation_id: Option<String>,
        hint: &IntentHint,
    ) -> Envelope {
        let snapshot = self.session.snapshot().await;
        match self.interpreter.build_intent(hint, &snapshot) {
            Ok(intent) => self.execute(client_id, correlation_id, intent).await,
            Err(e) => Self::interpret_failure(client_id, correlation_id, &e),
        }
    }

    fn interpret_failure(client_id: ClientId, correlation_id: Option<String>, error: &InterpretError) -> Envelope {
        tracing::info!(%client_id, kind = %error.kind(), "Command not interpreted: {error}");
        Envelope::error(correlation_id, error.kind(), error.to_string())
    }

    async fn execute(&self, client_id: ClientId, correlation_id: Option<String>, intent: Intent) -> Envelope {
        match self.dispatcher.dispatch(&intent, client_id).await {
            Ok(outcome) => {
                self.announce(client_id, &outcome).await;
                Envelope::response(correlation_id, intent.action(), outcome.payload, true)
            }
            Err(e @ (DispatchError::Backend(_) | DispatchError::Storage(_))) => {
                let retryable = matches!(&e, DispatchError::Backend(b) if b.retryable);
                Envelope::response(
                    correlation_id,
                    intent.action(),
                    json!({
                        "error": e.to_string(),
                        "error_kind": e.kind(),
                        "retryable": retryable,
                    }),
                    false,
                )
            }
            Err(e) => Envelope::error(correlation_id, e.kind(), e.to_string()),
        }
    }

    /// Broadcast session changes to every other client.
    async fn announce(&self, client_id: ClientId, outcome: &DispatchOutcome) {
        let change = outcome.update.change;
        if change.directory {
            let envelope = Envelope::contact_list(&outcome.update.snapshot.contacts, self.broadcast_limit);
            self.registry.broadcast(&envelope, Some(client_id)).await;
        }
        if change.touches_session_fields() {
            let envelope = Envelope::session_update(&outcome.update.snapshot);
            self.registry.broadcast(&envelope, Some(client_id)).await;
        }
    }

    async fn handle_ai_request(&self, correlation_id: Option<String>, prompt: &str, context: Option<&Value>) -> Envelope {
        let context = context.map(|c| match c {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        match tokio::time::timeout(self.model_timeout, self.model.generate(prompt, context.as_deref())).await {
            Ok(Ok(text)) => Envelope::response(correlation_id, "ai_response", Value::String(text), true),
            Ok(Err(e)) => Envelope::error(correlation_id, ErrorKind::BackendFailure, e.to_string()),
            Err(_) => Envelope::error(
                correlation_id,
                ErrorKind::DispatchTimeout,
                format!("language model did not answer within {:?}", self.model_timeout),
            ),
        }
    }

    async fn handle_contact_list_update(
        &self,
        client_id: ClientId,
        correlation_id: Option<String>,
        contacts: Vec<String>,
    ) -> Envelope {
        let update = self.session.replace_directory(contacts).await;
        let total_count = update.snapshot.contacts.len();
        if update.change.directory {
            let envelope = Envelope::contact_list(&update.snapshot.contacts, self.broadcast_limit);
            self.registry.broadcast(&envelope, Some(client_id)).await;
        }
        Envelope::response(
            correlation_id,
            "contact_list_updated",
            json!({ "total_count": total_count }),
            true,
        )
    }
}
