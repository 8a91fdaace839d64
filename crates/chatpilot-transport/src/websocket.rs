//! WebSocket transport for hub clients.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use chatpilot_session::Connection;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::{
    protocol::{Envelope, encode},
    router::{ConnectionContext, Hub},
};

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<Hub>,
}

impl WsState {
    #[must_use]
    pub const fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending envelopes to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let mut ctx = ConnectionContext::new(Connection::new(tx));
    let connection_id = ctx.connection().id();
    tracing::debug!(connection = %connection_id, "WebSocket connected");

    // Spawn task to forward envelopes to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if sender.send(Message::Text(encode(&envelope).into())).await.is_err() {
                break;
            }
        }
    });

    let idle_timeout = hub.idle_timeout();
    loop {
        let msg = match tokio::time::timeout(idle_timeout, receiver.next()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(connection = %connection_id, client_id = ?ctx.client_id(), "Connection idle, closing");
                break;
            }
        };

        match msg {
            Ok(Message::Text(text)) => hub.handle_text(&mut ctx, text.as_str()).await,
            Ok(Message::Binary(data)) => hub.handle_bytes(&mut ctx, &data).await,
            Ok(Message::Close(_)) => break,
            // Transport-level ping/pong still counts as activity.
            Ok(_) => {}
            Err(e) => {
                tracing::error!(connection = %connection_id, "WebSocket error: {e}");
                break;
            }
        }
    }

    hub.disconnect(&ctx).await;
    send_task.abort();
    tracing::info!(connection = %connection_id, client_id = ?ctx.client_id(), "WebSocket disconnected");
}

/// Create the hub router serving `/ws`.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_hub_router(hub));
/// ```
#[must_use]
pub fn create_hub_router(hub: Arc<Hub>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(WsState::new(hub))
}
