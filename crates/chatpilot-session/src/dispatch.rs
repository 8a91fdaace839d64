//! Dispatch coordinator.
//!
//! Hands validated intents to the automation backend, tracks each call as a
//! pending request, retries retryable failures and applies successful results
//! to the shared session.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chatpilot_core::{
    AutomationBackend, BackendError, ConversationStore, ErrorKind, HubConfig, Intent, IntentError,
    LanguageModel, RetryPolicy, SummaryTarget,
    traits::{StorageError, StoredMessage},
};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    now,
    registry::ClientId,
    store::{SessionStore, SessionUpdate},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sender name recorded for outgoing messages.
const OUTGOING_SENDER: &str = "me";

/// Dispatch error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Dispatch {correlation_id} timed out after {after:?}")]
    Timeout { correlation_id: Uuid, after: Duration },
    #[error("Backend failure: {0}")]
    Backend(#[from] BackendError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Invalid intent: {0}")]
    Invalid(#[from] IntentError),
}

impl DispatchError {
    /// Wire classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::DispatchTimeout,
            Self::Backend(_) | Self::Storage(_) => ErrorKind::BackendFailure,
            Self::Invalid(_) => ErrorKind::UnsupportedCommand,
        }
    }
}

/// In-flight backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub correlation_id: Uuid,
    pub client_id: ClientId,
    pub submitted_at: Instant,
    pub deadline: Instant,
}

/// Successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub correlation_id: Uuid,
    pub intent: Intent,
    /// Backend payload, possibly enriched with model output.
    pub payload: Value,
    /// Backend attempts it took.
    pub attempts: u32,
    /// Session mutation caused by the result.
    pub update: SessionUpdate,
}

/// Dispatch coordinator.
pub struct DispatchCoordinator {
    backend: Arc<dyn AutomationBackend>,
    session: Arc<SessionStore>,
    pending: RwLock<HashMap<Uuid, PendingRequest>>,
    timeout: Duration,
    retry: RetryPolicy,
    model: Option<Arc<dyn LanguageModel>>,
    model_timeout: Duration,
    conversations: Option<Arc<dyn ConversationStore>>,
}

impl DispatchCoordinator {
    /// Create a coordinator with default timeout and retry policy.
    #[must_use]
    pub fn new(backend: Arc<dyn AutomationBackend>, session: Arc<SessionStore>) -> Self {
        Self {
            backend,
            session,
            pending: RwLock::new(HashMap::new()),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            model: None,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            conversations: None,
        }
    }

    /// Create a coordinator from hub configuration.
    #[must_use]
    pub fn from_config(
        backend: Arc<dyn AutomationBackend>,
        session: Arc<SessionStore>,
        config: &HubConfig,
    ) -> Self {
        let mut coordinator = Self::new(backend, session)
            .with_timeout(config.request_timeout())
            .with_retry(config.retry);
        coordinator.model_timeout = config.model_timeout();
        coordinator
    }

    /// Deadline for a whole dispatch, retries included.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pass conversation text from summaries and reply suggestions through a model.
    #[must_use]
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Record sends and serve conversation summaries from a store.
    #[must_use]
    pub fn with_conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(store);
        self
    }

    /// Shared session this coordinator updates.
    #[must_use]
    pub const fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    /// Number of in-flight requests.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// In-flight requests submitted by a client.
    pub async fn pending_for(&self, client_id: ClientId) -> Vec<PendingRequest> {
        self.pending
            .read()
            .await
            .values()
            .filter(|p| p.client_id == client_id)
            .cloned()
            .collect()
    }

    /// Execute an intent and apply its result to the session.
    ///
    /// # Errors
    /// Returns `Timeout` if the backend does not answer in time, `Backend` on
    /// a terminal (or retry-exhausted) failure. The session is only touched
    /// on success.
    pub async fn dispatch(&self, intent: &Intent, client_id: ClientId) -> Result<DispatchOutcome, DispatchError> {
        intent.validate()?;

        let correlation_id = Uuid::new_v4();
        let submitted_at = Instant::now();
        self.pending.write().await.insert(
            correlation_id,
            PendingRequest {
                correlation_id,
                client_id,
                submitted_at,
                deadline: submitted_at + self.timeout,
            },
        );
        tracing::debug!(%correlation_id, %client_id, action = intent.action(), "Dispatching intent");

        let result = self.run(intent, correlation_id).await;
        self.pending.write().await.remove(&correlation_id);
        let (payload, attempts) = result?;

        let payload = self.enrich(intent, payload).await;
        let update = self.session.record_success(intent, &payload).await;
        self.persist(intent).await;

        tracing::info!(
            %correlation_id,
            %client_id,
            action = intent.action(),
            attempts,
            elapsed_ms = u64::try_from(submitted_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Intent executed"
        );

        Ok(DispatchOutcome {
            correlation_id,
            intent: intent.clone(),
            payload,
            attempts,
            update,
        })
    }

    async fn run(&self, intent: &Intent, correlation_id: Uuid) -> Result<(Value, u32), DispatchError> {
        let timed_out = || DispatchError::Timeout {
            correlation_id,
            after: self.timeout,
        };

        if let (
            Intent::Summarize {
                target: SummaryTarget::Conversation(id),
            },
            Some(store),
        ) = (intent, &self.conversations)
        {
            let payload = tokio::time::timeout(self.timeout, load_conversation(store.as_ref(), id))
                .await
                .map_err(|_| timed_out())??;
            return Ok((payload, 1));
        }

        let mut handle = tokio::spawn(execute_with_retry(
            Arc::clone(&self.backend),
            intent.clone(),
            self.retry,
            correlation_id,
        ));

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(BackendError::terminal(format!("backend task failed: {e}")).into()),
            Err(_) => {
                // The backend may still act on the intent; it is not cancelled.
                tracing::warn!(%correlation_id, timeout = ?self.timeout, "Dispatch timed out, backend call orphaned");
                tokio::spawn(async move {
                    if let Ok(result) = handle.await {
                        tracing::info!(%correlation_id, success = result.is_ok(), "Orphaned backend call finished");
                    }
                });
                Err(timed_out())
            }
        }
    }

    /// Add model output to summaries and reply suggestions.
    ///
    /// Model trouble never fails a dispatch that the backend completed.
    async fn enrich(&self, intent: &Intent, payload: Value) -> Value {
        let Some(model) = &self.model else {
            return payload;
        };
        let summary = match intent {
            Intent::Summarize { .. } => true,
            Intent::SuggestReply { .. } => false,
            _ => return payload,
        };
        let Some(text) = conversation_text(&payload) else {
            return payload;
        };

        let (field, call) = if summary {
            ("summary", model.summarize(&text))
        } else {
            ("suggestions", model.suggest_reply(&text))
        };

        let generated = match tokio::time::timeout(self.model_timeout, call).await {
            Ok(Ok(generated)) => generated,
            Ok(Err(e)) => {
                tracing::warn!(action = intent.action(), "Model enrichment failed: {e}");
                return payload;
            }
            Err(_) => {
                tracing::warn!(action = intent.action(), "Model enrichment timed out");
                return payload;
            }
        };

        let mut payload = match payload {
            Value::Object(_) => payload,
            other => json!({ "result": other }),
        };
        if let Value::Object(map) = &mut payload {
            map.insert(field.to_string(), Value::String(generated));
        }
        payload
    }

    /// Record an outgoing message in the conversation store.
    async fn persist(&self, intent: &Intent) {
        let (Some(store), Intent::Send { contact, message }) = (&self.conversations, intent) else {
            return;
        };
        let stored = StoredMessage {
            sender: OUTGOING_SENDER.to_string(),
            content: message.clone(),
            timestamp: now(),
        };
        if let Err(e) = store.append_message(contact, stored).await {
            tracing::warn!(contact = %contact, "Failed to record sent message: {e}");
        }
    }
}

async fn execute_with_retry(
    backend: Arc<dyn AutomationBackend>,
    intent: Intent,
    retry: RetryPolicy,
    correlation_id: Uuid,
) -> Result<(Value, u32), DispatchError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match backend.execute(&intent).await {
            Ok(payload) => return Ok((payload, attempt)),
            Err(e) if e.retryable && attempt < max_attempts => {
                let delay = retry.backoff(attempt);
                tracing::warn!(%correlation_id, attempt, ?delay, "Retryable backend failure: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!(%correlation_id, attempt, retryable = e.retryable, "Backend failure: {e}");
                return Err(e.into());
            }
        }
    }
}

async fn load_conversation(store: &dyn ConversationStore, id: &str) -> Result<Value, DispatchError> {
    let messages = store.load_conversation(id).await?;
    let text = messages
        .iter()
        .map(|m| format!("{}: {}", m.sender, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(json!({
        "conversation_id": id,
        "message_count": messages.len(),
        "conversation": text,
    }))
}

/// Conversation text carried by a backend payload, if any.
///
/// Accepts a `conversation` string or a `messages` array of strings or
/// `{sender, content}` objects.
fn conversation_text(payload: &Value) -> Option<String> {
    if let Some(text) = payload.get("conversation").and_then(Value::as_str) {
        return Some(text.to_string()).filter(|t| !t.trim().is_empty());
    }
    let lines: Vec<String> = payload
        .get("messages")?
        .as_array()?
        .iter()
        .filter_map(|m| match m {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => {
                let content = o.get("content").or_else(|| o.get("text"))?.as_str()?;
                Some(match o.get("sender").and_then(Value::as_str) {
                    Some(sender) => format!("{sender}: {content}"),
                    None => content.to_string(),
                })
            }
            _ => None,
        })
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}
