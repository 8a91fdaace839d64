//! WebSocket hub link.
//!
//! One writer task drains an outbound queue into the socket, one reader task
//! resolves pending requests by `correlation_id` and republishes everything
//! uncorrelated (broadcasts) on a channel. A keepalive task pings the hub.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chatpilot_core::FallbackConfig;
use chatpilot_transport::{Envelope, Payload, decode, encode};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::TcpStream,
    sync::{Mutex, broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::link::{HubConnector, HubLink, LinkError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CAPACITY: usize = 64;

/// Opens [`WsLink`]s to the configured hub.
#[derive(Debug, Clone)]
pub struct WsConnector {
    config: FallbackConfig,
}

impl WsConnector {
    #[must_use]
    pub const fn new(config: FallbackConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HubConnector for WsConnector {
    async fn connect(&self) -> Result<Arc<dyn HubLink>, LinkError> {
        let link = WsLink::connect(&self.config).await?;
        Ok(Arc::new(link))
    }
}

struct Shared {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    events: broadcast::Sender<Envelope>,
    closed: AtomicBool,
    timeout: Duration,
}

impl Shared {
    async fn request(&self, payload: Payload) -> Result<Envelope, LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id.clone(), tx);

        let envelope = Envelope::new(payload).with_correlation_id(correlation_id.as_str());
        if self.outbound.send(Message::Text(encode(&envelope).into())).is_err() {
            self.pending.lock().await.remove(&correlation_id);
            return Err(LinkError::Closed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&correlation_id);
                Err(LinkError::Timeout(self.timeout))
            }
        }
    }

    async fn deliver(&self, envelope: Envelope) {
        if let Some(id) = envelope.correlation_id.as_deref() {
            if let Some(waiter) = self.pending.lock().await.remove(id) {
                let _ = waiter.send(envelope);
                return;
            }
        }
        let _ = self.events.send(envelope);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders fails every waiter with `Closed`.
        self.pending.lock().await.clear();
    }
}

/// Registered WebSocket connection to the hub.
pub struct WsLink {
    shared: Arc<Shared>,
    client_id: String,
    tasks: Vec<JoinHandle<()>>,
}

impl WsLink {
    /// Connect, register under `config.client_name` and start keepalive.
    ///
    /// # Errors
    /// Returns error if the hub is unreachable or rejects the registration.
    pub async fn connect(config: &FallbackConfig) -> Result<Self, LinkError> {
        let timeout = config.request_timeout();
        let (socket, _) = tokio::time::timeout(timeout, connect_async(config.hub_url.as_str()))
            .await
            .map_err(|_| LinkError::Timeout(timeout))?
            .map_err(|e| LinkError::Connect(e.to_string()))?;

        let (sink, stream) = socket.split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            outbound,
            pending: Mutex::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
            timeout,
        });

        let mut link = Self {
            tasks: vec![
                tokio::spawn(write_loop(sink, rx)),
                tokio::spawn(read_loop(stream, Arc::clone(&shared))),
            ],
            shared,
            client_id: String::new(),
        };

        link.client_id = link.register(&config.client_name).await?;
        link.tasks.push(tokio::spawn(keepalive_loop(
            Arc::downgrade(&link.shared),
            config.keepalive_interval(),
        )));

        tracing::info!(client_id = %link.client_id, url = %config.hub_url, "Connected to hub");
        Ok(link)
    }

    async fn register(&self, client_name: &str) -> Result<String, LinkError> {
        let reply = self
            .shared
            .request(Payload::Register {
                client_name: client_name.to_string(),
            })
            .await?;
        match reply.payload {
            Payload::RegistrationConfirmed { client_id } => Ok(client_id),
            Payload::Error { message, .. } => Err(LinkError::Rejected(message)),
            other => Err(LinkError::Unexpected(format!("'{}' instead of registration_confirmed", other.kind()))),
        }
    }

    /// Hub broadcasts (frames without a pending correlation id).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.shared.events.subscribe()
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl HubLink for WsLink {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    async fn request(&self, payload: Payload) -> Result<Envelope, LinkError> {
        self.shared.request(payload).await
    }
}

async fn write_loop(mut sink: SplitSink<Socket, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<Socket>, shared: Arc<Shared>) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("Hub link error: {e}");
                break;
            }
        };
        match decode(text.as_str()) {
            Ok(envelope) => shared.deliver(envelope).await,
            Err(e) => tracing::warn!("Ignoring undecodable hub frame: {e}"),
        }
    }
    tracing::info!("Hub link closed");
    shared.close().await;
}

async fn keepalive_loop(shared: Weak<Shared>, period: Duration) {
    if period.is_zero() {
        return;
    }
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if let Err(e) = shared.request(Payload::Ping {}).await {
            tracing::warn!("Keepalive failed: {e}");
            if e.is_unreachable() {
                shared.close().await;
                return;
            }
        }
    }
}
