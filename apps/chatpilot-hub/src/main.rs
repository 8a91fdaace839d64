//! Chatpilot hub server.
//!
//! Run with: cargo run -p chatpilot-hub -- --config hub.toml
//!
//! Clients connect to `ws://<listen_addr>/ws`.

mod simulated;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{Json, routing::get};
use chatpilot_core::HubConfig;
use chatpilot_interpreter::RuleParser;
use chatpilot_session::storage::MemoryConversationStore;
use chatpilot_transport::{Hub, websocket::create_hub_router};
use clap::Parser;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::simulated::SimulatedBackend;

#[derive(Debug, Parser)]
#[command(name = "chatpilot-hub", version, about = "Multi-client messaging hub")]
struct Args {
    /// TOML config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen address.
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => HubConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => HubConfig::default(),
    };
    if let Some(addr) = args.listen {
        config.listen_addr = addr;
    }
    let addr = config.listen_addr;

    let hub = Hub::builder(Arc::new(SimulatedBackend::new()), Arc::new(RuleParser))
        .config(config)
        .conversation_store(Arc::new(MemoryConversationStore::new()))
        .build();

    let app = create_hub_router(hub)
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive());

    tracing::info!("Hub listening on ws://{addr}/ws");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
