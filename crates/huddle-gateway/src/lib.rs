//! # huddle-gateway
//!
//! Signaling relay for Huddle. Handles:
//! - Client connections with token authentication
//! - Routing of call-control and negotiation signals by user identity
//! - Presence (online/offline) and live voice-channel membership
//! - Heartbeat/keepalive and stale connection sweeping
//!
//! The relay is a router, not a participant: negotiation payloads pass through
//! verbatim and nothing is stored beyond the process lifetime.
//!
//! Routes:
//! - GET /relay              — WebSocket signaling connection
//! - GET /voice/ice-servers  — STUN/TURN servers for peer links
//! - GET /relay/stats        — live connection and channel counts
//! - GET /health             — liveness probe

pub mod auth;
pub mod error;
pub mod membership;
pub mod presence;
pub mod relay;

pub use auth::{Authenticator, JwtAuthenticator};
pub use error::RelayError;
pub use relay::{Relay, RelayStats};

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use huddle_common::config::RelayConfig;
use huddle_common::signal::IceServer;
use huddle_common::{ConnectionId, HuddleError, Signal, UserId};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Relay state shared by every connection task.
#[derive(Clone)]
pub struct RelayState {
    pub relay: Relay,
    pub auth: Arc<dyn Authenticator>,
    pub config: RelayConfig,
    pub ice_servers: Vec<IceServer>,
}

impl RelayState {
    pub fn new(
        auth: Arc<dyn Authenticator>,
        config: RelayConfig,
        ice_servers: Vec<IceServer>,
    ) -> Self {
        Self {
            relay: Relay::new(),
            auth,
            config,
            ice_servers,
        }
    }
}

/// Build the relay router.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/relay", get(ws_handler))
        .route("/voice/ice-servers", get(ice_servers))
        .route("/relay/stats", get(stats))
        .route("/health", get(health))
        .with_state(Arc::new(state))
}

/// Periodically unregister connections that stopped heartbeating.
pub fn spawn_presence_sweeper(relay: Relay, config: &RelayConfig) -> JoinHandle<()> {
    let timeout = config.presence_timeout();
    let period = config.heartbeat_interval().max(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let swept = relay.sweep(timeout).await;
            if swept > 0 {
                tracing::info!(swept, "Presence sweep removed stale connections");
            }
        }
    })
}

#[derive(Serialize)]
struct IceServersResponse {
    ice_servers: Vec<IceServer>,
}

async fn ice_servers(State(state): State<Arc<RelayState>>) -> Json<IceServersResponse> {
    Json(IceServersResponse {
        ice_servers: state.ice_servers.clone(),
    })
}

async fn stats(State(state): State<Arc<RelayState>>) -> Json<RelayStats> {
    Json(state.relay.stats().await)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Handle a single relay connection.
async fn handle_connection(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = ConnectionId::new();

    // Outbound queue: the relay and this task both push here, the sender task
    // drains it onto the socket.
    let (tx, mut rx) = mpsc::channel::<Signal>(state.config.outbound_buffer.max(1));

    // ── Sender task ──────────────────────────────────────────────────────────
    let send_task = tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            let text = match serde_json::to_string(&signal) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, kind = %signal.kind(), "Failed to encode signal");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // ── Receive loop ─────────────────────────────────────────────────────────
    let idle_timeout = state.config.presence_timeout();
    let mut user_id: Option<UserId> = None;

    loop {
        let msg = match tokio::time::timeout(idle_timeout, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::debug!(connection = %connection_id, error = %e, "Socket error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(connection = %connection_id, "Connection idle, closing");
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let signal = match serde_json::from_str::<Signal>(&text) {
            Ok(signal) => signal,
            Err(e) => {
                send_error(&tx, &RelayError::from(HuddleError::from(e))).await;
                continue;
            }
        };

        let Some(uid) = user_id.as_ref() else {
            let Signal::Identify { token } = signal else {
                send_error(&tx, &RelayError::NotAuthenticated).await;
                continue;
            };
            match state.auth.authenticate(&token) {
                Ok(uid) => {
                    // Ready goes out before registration so it is the first
                    // frame the client sees.
                    let ready = Signal::Ready {
                        user_id: uid.clone(),
                        connection_id,
                        heartbeat_interval_ms: state.config.heartbeat_interval_ms,
                        ice_servers: state.ice_servers.clone(),
                    };
                    if tx.send(ready).await.is_err() {
                        break;
                    }
                    state.relay.register(&uid, connection_id, tx.clone()).await;
                    tracing::info!(connection = %connection_id, user = %uid, "Relay READY sent");
                    user_id = Some(uid);
                }
                Err(e) => {
                    tracing::debug!(connection = %connection_id, error = %e, "Identify rejected");
                    send_error(&tx, &RelayError::from(e)).await;
                }
            }
            continue;
        };

        match state.relay.handle(connection_id, uid, signal).await {
            Ok(()) => {}
            // Already reported to the sender as `delivery:failed`
            Err(RelayError::DeliveryFailed { .. }) => {}
            Err(RelayError::UnknownConnection(_)) => {
                tracing::warn!(connection = %connection_id, "Connection was swept, closing");
                break;
            }
            Err(e) => {
                tracing::debug!(connection = %connection_id, error = %e, "Signal rejected");
                send_error(&tx, &e).await;
            }
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────────
    state.relay.unregister(connection_id).await;
    send_task.abort();
    tracing::info!(connection = %connection_id, "Client disconnected from relay");
}

async fn send_error(tx: &mpsc::Sender<Signal>, err: &RelayError) {
    let _ = tx
        .send(Signal::Error {
            code: err.code(),
            message: err.to_string(),
        })
        .await;
}
