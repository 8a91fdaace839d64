//! Client links against a hub served over real WebSockets.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chatpilot_client::{
    DirectExecutor, FallbackController, HubConnector, HubLink, LinkState, Route, WsConnector, WsLink,
};
use chatpilot_core::{
    AutomationBackend, BackendError, FallbackConfig, Intent, MatchPolicy, RetryPolicy, SessionSnapshot,
};
use chatpilot_interpreter::{Interpreter, RuleParser};
use chatpilot_transport::{Hub, Payload, websocket::create_hub_router};
use serde_json::{Value, json};

struct EchoBackend;

#[async_trait]
impl AutomationBackend for EchoBackend {
    async fn execute(&self, intent: &Intent) -> Result<Value, BackendError> {
        Ok(json!({ "action": intent.action() }))
    }
}

async fn start_hub() -> SocketAddr {
    let hub = Hub::builder(Arc::new(EchoBackend), Arc::new(RuleParser))
        .session(SessionSnapshot::with_contacts(["John", "Sarah", "Mike"]))
        .build();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_hub_router(hub)).await.unwrap();
    });
    addr
}

fn config(url: String, name: &str) -> FallbackConfig {
    FallbackConfig {
        hub_url: url,
        client_name: name.into(),
        reconnect: RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 10,
        },
        request_timeout_ms: 2_000,
        ..FallbackConfig::default()
    }
}

#[tokio::test]
async fn test_link_registers_and_correlates() {
    let addr = start_hub().await;
    let link = WsLink::connect(&config(format!("ws://{addr}/ws"), "phone"))
        .await
        .unwrap();
    assert!(!link.client_id().is_empty());

    let reply = link
        .request(Payload::Command {
            text: "send Sarah on my way".into(),
            context: None,
        })
        .await
        .unwrap();
    let Payload::Response { success, content, .. } = reply.payload else {
        panic!("expected response, got {}", reply.payload.kind());
    };
    assert!(success);
    assert_eq!(content["action"], "send");

    let reply = link.request(Payload::Ping {}).await.unwrap();
    assert_eq!(reply.payload, Payload::Pong {});
}

#[tokio::test]
async fn test_link_receives_broadcasts() {
    let addr = start_hub().await;
    let url = format!("ws://{addr}/ws");
    let phone = WsLink::connect(&config(url.clone(), "phone")).await.unwrap();
    let laptop = WsLink::connect(&config(url, "laptop")).await.unwrap();
    let mut events = laptop.subscribe();

    phone
        .request(Payload::Command {
            text: "send Mike hello".into(),
            context: None,
        })
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.correlation_id, None);
    assert!(matches!(
        event.payload,
        Payload::SessionUpdate { last_contact: Some(ref c), .. } if c == "Mike"
    ));
}

#[tokio::test]
async fn test_controller_over_websocket() {
    let addr = start_hub().await;
    let config = config(format!("ws://{addr}/ws"), "tablet");
    let direct = DirectExecutor::new(
        Interpreter::new(Arc::new(RuleParser), MatchPolicy::default()),
        Arc::new(EchoBackend),
        Duration::from_secs(1),
    );
    let controller = FallbackController::new(Arc::new(WsConnector::new(config.clone())), direct, config);

    assert_eq!(controller.start().await, LinkState::Connected);
    assert_eq!(controller.snapshot().await.contacts, vec!["John", "Sarah", "Mike"]);

    let reply = controller.execute("send John see you at 6").await;
    assert_eq!(reply.route, Route::Hub);
    assert_eq!(controller.snapshot().await.last_contact.as_deref(), Some("John"));
}

#[tokio::test]
async fn test_unreachable_hub_degrades() {
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let config = config(format!("ws://{addr}/ws"), "offline");
    let connector = WsConnector::new(config.clone());
    assert!(connector.connect().await.err().unwrap().is_unreachable());

    let direct = DirectExecutor::new(
        Interpreter::new(Arc::new(RuleParser), MatchPolicy::default()),
        Arc::new(EchoBackend),
        Duration::from_secs(1),
    );
    direct
        .replace_snapshot(SessionSnapshot::with_contacts(["John"]))
        .await;
    let controller = FallbackController::new(Arc::new(connector), direct, config);

    assert_eq!(controller.start().await, LinkState::Degraded);
    let reply = controller.execute("read John").await;
    assert_eq!(reply.route, Route::Direct);
    assert!(matches!(reply.envelope.payload, Payload::Response { success: true, .. }));
}
