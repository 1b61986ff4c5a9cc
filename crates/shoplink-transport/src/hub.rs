//! Development relay hub using Axum.
//!
//! Stands in for the storefront backend's `/ws` endpoint: greets every
//! client with `connection_established`, relays each valid envelope a
//! client sends to all connected clients, and lets the host process push
//! envelopes or drop every connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use shoplink_protocol::{Envelope, MessageTypes};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::endpoint::{DEFAULT_PATH, DEFAULT_DEV_HOST};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid listen address {0}")]
    Address(#[from] std::net::AddrParseError),
    #[error("failed to bind: {0}")]
    Io(#[from] std::io::Error),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Realtime path
    pub path: String,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
}

impl Default for HubConfig {
    fn default() -> Self {
        let port = DEFAULT_DEV_HOST
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(5000);
        Self {
            port,
            hostname: "127.0.0.1".into(),
            path: DEFAULT_PATH.into(),
            max_connections: Some(32),
        }
    }
}

/// What the hub pushes to every connection task.
#[derive(Debug, Clone)]
enum HubSignal {
    Frame(String),
    DisconnectAll,
}

/// Shared state for the hub.
struct AppState {
    config: HubConfig,
    signal_tx: broadcast::Sender<HubSignal>,
    client_count: Arc<AtomicUsize>,
}

/// A running hub.
pub struct DevHub {
    signal_tx: broadcast::Sender<HubSignal>,
    client_count: Arc<AtomicUsize>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
    path: String,
}

impl DevHub {
    pub async fn start(config: HubConfig) -> Result<Self, HubError> {
        let (signal_tx, _) = broadcast::channel(1024);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let client_count = Arc::new(AtomicUsize::new(0));

        let path = if config.path.starts_with('/') {
            config.path.clone()
        } else {
            format!("/{}", config.path)
        };

        let state = Arc::new(AppState {
            config: config.clone(),
            signal_tx: signal_tx.clone(),
            client_count: client_count.clone(),
        });

        let app = Router::new()
            .route(&path, get(ws_upgrade_handler))
            .route("/health", get(health_handler))
            .with_state(state);

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!("Dev hub listening on ws://{}:{}{}", config.hostname, actual_port, path);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
            {
                error!("Dev hub server error: {e}");
            }
        });

        Ok(Self {
            signal_tx,
            client_count,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
            path,
        })
    }

    /// Send an envelope to every connected client.
    pub fn broadcast(&self, envelope: &Envelope) {
        // No receivers is fine
        let _ = self.signal_tx.send(HubSignal::Frame(envelope.to_text()));
    }

    /// Drop every live connection. Clients see a server-initiated close.
    pub fn disconnect_all(&self) {
        let _ = self.signal_tx.send(HubSignal::DisconnectAll);
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` clients should dial.
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Gracefully stop the hub.
    pub async fn stop(&mut self) {
        self.disconnect_all();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Dev hub stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if let Some(max) = state.config.max_connections {
        let current = state.client_count.load(Ordering::Relaxed);
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.client_count.load(Ordering::Relaxed),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    state.client_count.fetch_add(1, Ordering::Relaxed);

    let client_id = uuid::Uuid::new_v4().to_string();
    info!("Client connected: {client_id}");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut signal_rx = state.signal_tx.subscribe();

    let welcome = Envelope::bare(MessageTypes::CONNECTION_ESTABLISHED).to_text();
    if let Err(e) = ws_tx.send(Message::Text(welcome.into())).await {
        error!("Failed to greet {client_id}: {e}");
        state.client_count.fetch_sub(1, Ordering::Relaxed);
        return;
    }

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match Envelope::parse(text.as_str()) {
                            Ok(envelope) => {
                                debug!(kind = %envelope.kind, "Relaying message from {client_id}");
                                let _ = state.signal_tx.send(HubSignal::Frame(envelope.to_text()));
                            }
                            Err(e) => warn!("Ignoring malformed frame from {client_id}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client disconnected: {client_id}");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {client_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            signal = signal_rx.recv() => {
                match signal {
                    Ok(HubSignal::Frame(text)) => {
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            error!("Failed to relay to {client_id}: {e}");
                            break;
                        }
                    }
                    Ok(HubSignal::DisconnectAll) => {
                        debug!("Dropping {client_id} on request");
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("{client_id} lagged, skipped {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    let remaining = state.client_count.fetch_sub(1, Ordering::Relaxed) - 1;
    info!(remaining, "Client {client_id} left");
}
