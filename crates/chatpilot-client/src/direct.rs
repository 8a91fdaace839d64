//! Direct execution while the hub is unreachable.
//!
//! Commands are interpreted against the client's last known session snapshot
//! and dispatched through the same coordinator the hub uses, so retries,
//! deadlines and model enrichment behave alike on both routes. Replies use
//! the envelope shapes the hub would have produced.

use std::{sync::Arc, time::Duration};

use chatpilot_core::{AutomationBackend, Intent, RetryPolicy, SessionSnapshot};
use chatpilot_interpreter::Interpreter;
use chatpilot_session::{ClientId, DispatchCoordinator, DispatchError, SessionStore};
use chatpilot_transport::Envelope;
use serde_json::json;
use uuid::Uuid;

/// Local interpreter, dispatcher and session copy.
pub struct DirectExecutor {
    interpreter: Interpreter,
    dispatcher: DispatchCoordinator,
    session: Arc<SessionStore>,
    client_id: ClientId,
}

impl DirectExecutor {
    #[must_use]
    pub fn new(interpreter: Interpreter, backend: Arc<dyn AutomationBackend>, timeout: Duration) -> Self {
        let session = Arc::new(SessionStore::new());
        let dispatcher = DispatchCoordinator::new(backend, Arc::clone(&session))
            .with_timeout(timeout)
            .with_model(interpreter.model());
        Self {
            interpreter,
            dispatcher,
            session,
            client_id: Uuid::new_v4(),
        }
    }

    /// Retry schedule for retryable backend failures.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.dispatcher = self.dispatcher.with_retry(retry);
        self
    }

    /// Copy of the local session snapshot.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot().await
    }

    /// Overwrite the local snapshot, e.g. with one fetched from the hub.
    pub async fn replace_snapshot(&self, snapshot: SessionSnapshot) {
        self.session.replace_snapshot(snapshot).await;
    }

    /// Interpret and execute a command locally.
    pub async fn execute(&self, text: &str) -> Envelope {
        let snapshot = self.snapshot().await;
        let intent = match self.interpreter.interpret(text, &snapshot).await {
            Ok(intent) => intent,
            Err(e) => {
                tracing::info!(kind = %e.kind(), "Command not interpreted locally: {e}");
                return Envelope::error(None, e.kind(), e.to_string());
            }
        };
        self.dispatch(&intent).await
    }

    async fn dispatch(&self, intent: &Intent) -> Envelope {
        match self.dispatcher.dispatch(intent, self.client_id).await {
            Ok(outcome) => Envelope::response(None, intent.action(), outcome.payload, true),
            Err(e @ (DispatchError::Backend(_) | DispatchError::Storage(_))) => {
                let retryable = matches!(&e, DispatchError::Backend(b) if b.retryable);
                Envelope::response(
                    None,
                    intent.action(),
                    json!({
                        "error": e.to_string(),
                        "error_kind": e.kind(),
                        "retryable": retryable,
                    }),
                    false,
                )
            }
            Err(e) => Envelope::error(None, e.kind(), e.to_string()),
        }
    }
}
