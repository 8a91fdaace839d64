//! Fallback controller.
//!
//! ```text
//!   Connected ──link failure──▶ Reconnecting ──budget spent──▶ Degraded
//!       ▲                           │    ▲                        │
//!       └──────────reconnected──────┘    └────hub reachable again───┘
//! ```
//!
//! Every return to `Connected` goes through a fresh `snapshot_request` so the
//! local session copy used in degraded mode matches the hub's.

use std::sync::Arc;

use chatpilot_core::{FallbackConfig, SessionSnapshot};
use chatpilot_transport::{CommandContext, Envelope, Payload};
use tokio::{
    sync::{Mutex, RwLock, watch},
    task::JoinHandle,
};

use crate::{
    direct::DirectExecutor,
    link::{HubConnector, HubLink, LinkError},
};

/// Hub link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Reconnecting,
    Degraded,
}

/// Which path produced a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Hub,
    Direct,
}

/// Outcome of [`FallbackController::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub route: Route,
    pub envelope: Envelope,
}

/// Drives one client's hub link and switches to direct execution when the
/// hub stays unreachable.
pub struct FallbackController {
    connector: Arc<dyn HubConnector>,
    direct: DirectExecutor,
    config: FallbackConfig,
    link: RwLock<Option<Arc<dyn HubLink>>>,
    state: watch::Sender<LinkState>,
    transitions: Mutex<Vec<(LinkState, LinkState)>>,
    // Serializes reconnects and hub checks.
    recovery: Mutex<()>,
}

impl FallbackController {
    #[must_use]
    pub fn new(connector: Arc<dyn HubConnector>, direct: DirectExecutor, config: FallbackConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Reconnecting);
        Self {
            connector,
            direct,
            config,
            link: RwLock::new(None),
            state,
            transitions: Mutex::new(Vec::new()),
            recovery: Mutex::new(()),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Every transition so far, oldest first.
    pub async fn transitions(&self) -> Vec<(LinkState, LinkState)> {
        self.transitions.lock().await.clone()
    }

    /// Local session copy.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.direct.snapshot().await
    }

    /// Initial connection. Ends `Connected` or `Degraded`.
    pub async fn start(&self) -> LinkState {
        let _guard = self.recovery.lock().await;
        self.reconnect().await
    }

    /// Run a command through the hub, or locally while degraded.
    ///
    /// A link failure triggers one reconnection cycle; if that succeeds the
    /// command is resent once, otherwise it runs directly. A command arriving
    /// mid-reconnection waits for the cycle to finish.
    pub async fn execute(&self, text: &str) -> Reply {
        for _ in 0..2 {
            let Some(link) = self.ready_link().await else {
                break;
            };
            match self.send_command(link.as_ref(), text).await {
                Ok(envelope) => {
                    return Reply {
                        route: Route::Hub,
                        envelope,
                    };
                }
                Err(e) if e.is_unreachable() => {
                    tracing::warn!("Hub request failed: {e}");
                    self.recover(&link).await;
                }
                Err(e) => {
                    return Reply {
                        route: Route::Hub,
                        envelope: Envelope::error(None, e.kind(), e.to_string()),
                    };
                }
            }
        }

        Reply {
            route: Route::Direct,
            envelope: self.direct.execute(text).await,
        }
    }

    /// Try the hub once while degraded.
    pub async fn check_hub(&self) -> LinkState {
        let _guard = self.recovery.lock().await;
        if self.state() != LinkState::Degraded {
            return self.state();
        }

        let link = match self.connector.connect().await {
            Ok(link) => link,
            Err(e) => {
                tracing::debug!("Hub still unreachable: {e}");
                return LinkState::Degraded;
            }
        };

        self.transition(LinkState::Reconnecting).await;
        if self.adopt(link).await {
            LinkState::Connected
        } else {
            self.transition(LinkState::Degraded).await;
            LinkState::Degraded
        }
    }

    /// Check the hub periodically while degraded and recover links that died quietly.
    pub fn spawn_monitor(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.recheck_interval();
        tokio::spawn(async move {
            if period.is_zero() {
                return;
            }
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match self.state() {
                    LinkState::Degraded => {
                        self.check_hub().await;
                    }
                    LinkState::Connected => {
                        if let Some(link) = self.current_link().await {
                            if link.is_closed() {
                                tracing::warn!("Hub link closed, reconnecting");
                                self.recover(&link).await;
                            }
                        }
                    }
                    LinkState::Reconnecting => {}
                }
            }
        })
    }

    async fn current_link(&self) -> Option<Arc<dyn HubLink>> {
        self.link.read().await.clone()
    }

    /// Link to send on, waiting out a reconnection in progress.
    ///
    /// `None` only once the controller is `Degraded`.
    async fn ready_link(&self) -> Option<Arc<dyn HubLink>> {
        if let Some(link) = self.current_link().await {
            return Some(link);
        }
        if self.state() == LinkState::Degraded {
            return None;
        }

        let _guard = self.recovery.lock().await;
        if let Some(link) = self.current_link().await {
            return Some(link);
        }
        if self.state() == LinkState::Reconnecting {
            self.reconnect().await;
        }
        self.current_link().await
    }

    /// Handle a failure on `failed`, unless another task already replaced it.
    async fn recover(&self, failed: &Arc<dyn HubLink>) -> LinkState {
        let _guard = self.recovery.lock().await;
        let still_current = self
            .link
            .read()
            .await
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, failed));
        if !still_current {
            return self.state();
        }
        self.reconnect().await
    }

    /// Reconnection cycle. Caller holds `recovery`.
    async fn reconnect(&self) -> LinkState {
        self.transition(LinkState::Reconnecting).await;
        *self.link.write().await = None;

        let policy = self.config.reconnect;
        let attempts = policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.connector.connect().await {
                Ok(link) => {
                    if self.adopt(link).await {
                        return LinkState::Connected;
                    }
                }
                Err(e) => tracing::warn!(attempt, "Hub connection failed: {e}"),
            }
            if attempt < attempts {
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
        }

        tracing::warn!(attempts, "Hub unreachable, executing commands directly");
        self.transition(LinkState::Degraded).await;
        LinkState::Degraded
    }

    /// Reconcile through a new link and make it current.
    async fn adopt(&self, link: Arc<dyn HubLink>) -> bool {
        match self.reconcile(link.as_ref()).await {
            Ok(()) => {}
            Err(e) if e.is_unreachable() => {
                tracing::warn!("Snapshot request failed: {e}");
                return false;
            }
            Err(e) => tracing::warn!("Keeping local session, snapshot unusable: {e}"),
        }
        tracing::info!(client_id = link.client_id(), "Hub link established");
        *self.link.write().await = Some(link);
        self.transition(LinkState::Connected).await;
        true
    }

    async fn reconcile(&self, link: &dyn HubLink) -> Result<(), LinkError> {
        let reply = link.request(Payload::SnapshotRequest {}).await?;
        match reply.payload {
            Payload::Response {
                response_type,
                content,
                success: true,
            } if response_type == "session_snapshot" => {
                let snapshot: SessionSnapshot =
                    serde_json::from_value(content).map_err(|e| LinkError::Unexpected(e.to_string()))?;
                self.direct.replace_snapshot(snapshot).await;
                Ok(())
            }
            other => Err(LinkError::Unexpected(format!(
                "'{}' instead of session_snapshot",
                other.kind()
            ))),
        }
    }

    async fn send_command(&self, link: &dyn HubLink, text: &str) -> Result<Envelope, LinkError> {
        let local = self.direct.snapshot().await;
        let context = CommandContext {
            contact_list: (!local.contacts.is_empty()).then_some(local.contacts),
            last_contact: local.last_contact,
        };
        let reply = link
            .request(Payload::Command {
                text: text.to_string(),
                context: Some(context),
            })
            .await?;

        if matches!(reply.payload, Payload::Response { success: true, .. }) {
            if let Err(e) = self.reconcile(link).await {
                tracing::debug!("Local session not refreshed: {e}");
            }
        }
        Ok(reply)
    }

    async fn transition(&self, to: LinkState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::info!(?from, ?to, "Hub link state changed");
            self.transitions.lock().await.push((from, to));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use chatpilot_core::{AutomationBackend, BackendError, Intent, MatchPolicy, RetryPolicy};
    use chatpilot_interpreter::{Interpreter, RuleParser};
    use serde_json::{Value, json};

    struct Hub {
        reachable: AtomicBool,
        connects: AtomicUsize,
        connect_delay: Duration,
        snapshot: StdMutex<SessionSnapshot>,
    }

    impl Hub {
        fn snapshot(&self) -> SessionSnapshot {
            self.snapshot.lock().unwrap().clone()
        }
    }

    struct ScriptedConnector(Arc<Hub>);

    struct ScriptedLink(Arc<Hub>);

    #[async_trait]
    impl HubConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Arc<dyn HubLink>, LinkError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.0.connect_delay).await;
            if self.0.reachable.load(Ordering::SeqCst) {
                Ok(Arc::new(ScriptedLink(Arc::clone(&self.0))))
            } else {
                Err(LinkError::Connect("connection refused".into()))
            }
        }
    }

    #[async_trait]
    impl HubLink for ScriptedLink {
        fn client_id(&self) -> &str {
            "scripted"
        }

        async fn request(&self, payload: Payload) -> Result<Envelope, LinkError> {
            if !self.0.reachable.load(Ordering::SeqCst) {
                return Err(LinkError::Closed);
            }
            let envelope = match payload {
                Payload::SnapshotRequest {} => Envelope::response(
                    None,
                    "session_snapshot",
                    serde_json::to_value(self.0.snapshot()).unwrap(),
                    true,
                ),
                Payload::Command { .. } => Envelope::response(None, "send", json!({ "via": "hub" }), true),
                _ => Envelope::new(Payload::Pong {}),
            };
            Ok(envelope)
        }
    }

    struct LocalBackend;

    #[async_trait]
    impl AutomationBackend for LocalBackend {
        async fn execute(&self, _intent: &Intent) -> Result<Value, BackendError> {
            Ok(json!({ "via": "direct" }))
        }
    }

    fn controller(hub: &Arc<Hub>) -> FallbackController {
        let direct = DirectExecutor::new(
            Interpreter::new(Arc::new(RuleParser), MatchPolicy::default()),
            Arc::new(LocalBackend),
            Duration::from_secs(1),
        );
        let config = FallbackConfig {
            reconnect: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
            },
            ..FallbackConfig::default()
        };
        FallbackController::new(Arc::new(ScriptedConnector(Arc::clone(hub))), direct, config)
    }

    fn hub(reachable: bool) -> Arc<Hub> {
        hub_with_delay(reachable, Duration::ZERO)
    }

    fn hub_with_delay(reachable: bool, connect_delay: Duration) -> Arc<Hub> {
        Arc::new(Hub {
            reachable: AtomicBool::new(reachable),
            connects: AtomicUsize::new(0),
            connect_delay,
            snapshot: StdMutex::new(SessionSnapshot {
                last_contact: Some("Sarah".into()),
                ..SessionSnapshot::with_contacts(["John", "Sarah"])
            }),
        })
    }

    fn content(reply: &Reply) -> &Value {
        match &reply.envelope.payload {
            Payload::Response { content, .. } => content,
            other => panic!("expected response, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_start_reconciles_session() {
        let hub = hub(true);
        let controller = controller(&hub);

        assert_eq!(controller.start().await, LinkState::Connected);
        assert_eq!(controller.snapshot().await, hub.snapshot());

        let reply = controller.execute("send John hi").await;
        assert_eq!(reply.route, Route::Hub);
        assert_eq!(content(&reply)["via"], "hub");
    }

    #[tokio::test]
    async fn test_start_degrades_after_budget() {
        let hub = hub(false);
        let controller = controller(&hub);

        assert_eq!(controller.start().await, LinkState::Degraded);
        assert_eq!(hub.connects.load(Ordering::SeqCst), 3);
        assert_eq!(
            controller.transitions().await,
            vec![(LinkState::Reconnecting, LinkState::Degraded)]
        );
    }

    #[tokio::test]
    async fn test_fallback_cycle() {
        let hub = hub(true);
        let controller = controller(&hub);
        controller.start().await;

        hub.reachable.store(false, Ordering::SeqCst);
        let reply = controller.execute("tell her running late").await;
        assert_eq!(reply.route, Route::Direct);
        assert_eq!(content(&reply)["via"], "direct");
        assert_eq!(controller.state(), LinkState::Degraded);

        // Pronoun resolved from the last snapshot the hub handed out.
        assert_eq!(controller.snapshot().await.last_contact.as_deref(), Some("Sarah"));

        assert_eq!(controller.check_hub().await, LinkState::Degraded);

        // Other clients moved the session on while this one was offline.
        let moved_on = SessionSnapshot {
            last_contact: Some("Mike".into()),
            ..SessionSnapshot::with_contacts(["John", "Sarah", "Mike"])
        };
        *hub.snapshot.lock().unwrap() = moved_on.clone();

        hub.reachable.store(true, Ordering::SeqCst);
        assert_eq!(controller.check_hub().await, LinkState::Connected);
        assert_eq!(controller.snapshot().await, moved_on);

        assert_eq!(
            controller.transitions().await,
            vec![
                (LinkState::Reconnecting, LinkState::Connected),
                (LinkState::Connected, LinkState::Reconnecting),
                (LinkState::Reconnecting, LinkState::Degraded),
                (LinkState::Degraded, LinkState::Reconnecting),
                (LinkState::Reconnecting, LinkState::Connected),
            ]
        );

        let reply = controller.execute("send John back online").await;
        assert_eq!(reply.route, Route::Hub);
    }

    #[tokio::test]
    async fn test_hub_check_is_noop_when_connected() {
        let hub = hub(true);
        let controller = controller(&hub);
        controller.start().await;
        let connects = hub.connects.load(Ordering::SeqCst);

        assert_eq!(controller.check_hub().await, LinkState::Connected);
        assert_eq!(hub.connects.load(Ordering::SeqCst), connects);
    }

    #[tokio::test]
    async fn test_command_waits_for_reconnection_in_progress() {
        let hub = hub_with_delay(true, Duration::from_millis(50));
        let controller = Arc::new(controller(&hub));
        assert_eq!(controller.start().await, LinkState::Connected);

        let mut state = controller.subscribe();
        hub.reachable.store(false, Ordering::SeqCst);
        let first = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.execute("send John one").await }
        });

        state
            .wait_for(|s| *s == LinkState::Reconnecting)
            .await
            .unwrap();
        hub.reachable.store(true, Ordering::SeqCst);
        let second = controller.execute("send John two").await;

        assert_eq!(second.route, Route::Hub);
        assert_eq!(first.await.unwrap().route, Route::Hub);
        assert_eq!(controller.state(), LinkState::Connected);
        assert!(
            !controller
                .transitions()
                .await
                .contains(&(LinkState::Reconnecting, LinkState::Degraded))
        );
    }
}
