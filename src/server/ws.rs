//! WebSocket adapter for the signaling hub, plus the HTTP surface.
//!
//! One task per connection pumps decoded [`ClientEvent`]s into the hub
//! and executes the resulting [`HubAction`]s against the per-peer
//! sender map. The hub and the sender map each sit behind one mutex;
//! there is no cross-room contention worth sharding for.

use crate::core::protocol::{ClientEvent, ServerEvent};
use crate::server::config::ServerConfig;
use crate::server::hub::{HubAction, SignalingHub};
use crate::utils::ids::secure_id;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared state handed to every connection handler.
#[derive(Clone)]
pub struct AppState {
    hub: Arc<Mutex<SignalingHub>>,
    peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ServerEvent>>>>,
    config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let hub = SignalingHub::with_limits(
            config.max_signal_payload,
            config.max_peers_per_room,
            config.room_ttl,
        );
        Self {
            hub: Arc::new(Mutex::new(hub)),
            peers: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    /// Deliver hub actions to their target peers. A missing sink means
    /// the peer disconnected between dispatch and delivery; the next
    /// hub call for that peer cleans its state up.
    async fn execute(&self, actions: Vec<HubAction>) {
        let peers = self.peers.lock().await;
        for action in actions {
            match action {
                HubAction::Send { to, event } => {
                    if let Some(tx) = peers.get(&to) {
                        let _ = tx.send(event);
                    } else {
                        debug!(event = "send_to_departed_peer", peer = %to);
                    }
                }
            }
        }
    }
}

/// Build the full HTTP surface: signaling WebSocket, runtime config,
/// liveness probe.
pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/config", get(runtime_config))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Periodic room TTL sweep, until the process exits.
pub fn spawn_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(crate::core::config::SWEEP_INTERVAL);
        // The first tick fires immediately; skip it so a fresh server
        // does not log an empty sweep.
        interval.tick().await;
        loop {
            interval.tick().await;
            let evicted = state.hub.lock().await.sweep(Instant::now());
            if evicted > 0 {
                info!(event = "ttl_sweep", evicted);
            }
        }
    })
}

/// `GET /config` — the client-visible runtime configuration.
async fn runtime_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.runtime.clone())
}

/// `GET`/`HEAD /healthz` — liveness for orchestrators and client
/// keep-alive probes. Never cached.
async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CACHE_CONTROL, "no-store")],
        "ok",
    )
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let peer_id = secure_id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.peers.lock().await.insert(peer_id.clone(), tx);
    info!(event = "peer_connected", peer = %peer_id);

    // Forward hub replies from the channel onto the socket.
    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(event = "encode_failed", peer = %writer_peer, error = %e),
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        let msg = match frame {
            Ok(m) => m,
            Err(e) => {
                debug!(event = "socket_error", peer = %peer_id, error = %e);
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                let actions = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        state
                            .hub
                            .lock()
                            .await
                            .handle(&peer_id, text.len(), event, Instant::now())
                    }
                    Err(e) => {
                        warn!(event = "malformed_event", peer = %peer_id, error = %e);
                        vec![HubAction::Send {
                            to: peer_id.clone(),
                            event: ServerEvent::app_error("malformed signaling event"),
                        }]
                    }
                };
                state.execute(actions).await;
            }
            Message::Close(_) => break,
            // Binary frames have no meaning on the signaling link;
            // pings/pongs are handled by axum.
            _ => {}
        }
    }

    state.hub.lock().await.disconnect(&peer_id);
    state.peers.lock().await.remove(&peer_id);
    writer.abort();
    info!(event = "peer_disconnected", peer = %peer_id);
}
