//! Signaling relay: WebSocket sessions plus a small HTTP surface.
//!
//! Architecture:
//! ```text
//! Client A ──ws──┐                          ┌── GET /health
//!                ├── session loop ── RoomRegistry ── GET /rooms/:id
//! Client B ──ws──┘       │
//!                        └── outbound queue (bounded, per session)
//! ```
//!
//! The relay never sits on the data path: it only forwards join/leave
//! notifications and opaque handshake payloads between named peers. Rooms
//! live in memory and vanish with the process.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use swarmtech_core::{now_millis, AgentId};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::protocol::SignalMessage;
use crate::registry::{RoomRegistry, SessionHandle, SessionId};

/// Relay statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rooms: usize,
    pub relayed_frames: u64,
    pub dropped_frames: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
}

/// Shared state behind every route.
#[derive(Clone)]
pub struct RelayState {
    registry: Arc<RoomRegistry>,
    counters: Arc<Counters>,
    started: Instant,
    outbound_capacity: usize,
}

impl RelayState {
    fn new(outbound_capacity: usize) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            counters: Arc::new(Counters::default()),
            started: Instant::now(),
            outbound_capacity,
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub async fn stats(&self) -> RelayStats {
        let registry = self.registry.stats().await;
        RelayStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            rooms: registry.rooms,
            relayed_frames: registry.relayed,
            dropped_frames: registry.dropped,
        }
    }
}

pub struct RelayServer {
    config: RelayConfig,
    state: RelayState,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let state = RelayState::new(config.outbound_capacity);
        Self { config, state }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn state(&self) -> RelayState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/rooms/:id", get(room_info))
            .route("/ws", get(ws_upgrade))
            .with_state(self.state.clone())
    }

    /// Bind `config.bind_addr` and serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        log::info!("Signaling relay listening on {}", listener.local_addr()?);
        if let Some(client_url) = &self.config.client_url {
            log::info!("Accepting clients from {client_url}");
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        let stats = self.state.stats().await;
        log::info!(
            "Relay stopped: {} connections served, {} frames relayed, {} dropped",
            stats.total_connections,
            stats.relayed_frames,
            stats.dropped_frames
        );
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────

async fn health(State(state): State<RelayState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime": state.started.elapsed().as_secs_f64(),
        "rooms": state.registry.room_count().await,
        "timestamp": now_millis(),
    }))
}

async fn room_info(State(state): State<RelayState>, Path(id): Path<String>) -> Response {
    match state.registry.room_info(&id).await {
        Some(info) => Json(info).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "Room not found" }))).into_response(),
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ─────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────

/// Relay-side binding of one connection to a (room, agent) pair.
struct PeerSession {
    id: SessionId,
    handle: SessionHandle,
    bound: Option<(String, AgentId)>,
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut outbound) = mpsc::channel::<SignalMessage>(state.outbound_capacity);
    let id = Uuid::new_v4();
    let mut session = PeerSession { id, handle: SessionHandle::new(id, tx), bound: None };

    state.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    state.counters.active_connections.fetch_add(1, Ordering::Relaxed);
    log::debug!("Session {id} connected");

    let watchdog = session.handle.clone();
    loop {
        tokio::select! {
            _ = watchdog.overflowed() => {
                log::warn!("Session {id}: outbound queue overflowed, closing");
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => match SignalMessage::decode(&bytes) {
                    Ok(signal) => handle_signal(&state, &mut session, signal).await,
                    Err(e) => log::warn!("Session {id}: dropping malformed frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::warn!("Session {id}: websocket error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
            Some(signal) = outbound.recv() => {
                let frame = match signal.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("Session {id}: failed to encode {}: {e}", signal.name());
                        continue;
                    }
                };
                if ws_sender.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some((room_id, agent_id)) = session.bound.take() {
        state.registry.leave_session(&room_id, &agent_id, id).await;
    }
    state.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::debug!("Session {id} closed");
}

async fn handle_signal(state: &RelayState, session: &mut PeerSession, signal: SignalMessage) {
    if let Some((kind, _claimed_from, to, payload)) = signal.as_relayed() {
        match &session.bound {
            // `from` is always the sender's bound agent, whatever it claims.
            Some((room_id, from)) => {
                state.registry.relay(room_id, kind, from, to, payload.to_string()).await;
            }
            None => log::debug!("Session {}: {} before join-room, dropped", session.id, signal.name()),
        }
        return;
    }

    match signal {
        SignalMessage::JoinRoom { room_id, agent } => {
            if let Some((previous_room, previous_agent)) = session.bound.take() {
                if previous_room != room_id || previous_agent != agent.id {
                    state.registry.leave_session(&previous_room, &previous_agent, session.id).await;
                }
            }
            session.bound = Some((room_id.clone(), agent.id.clone()));
            state.registry.join(&room_id, agent, session.handle.clone()).await;
        }
        SignalMessage::LeaveRoom => {
            if let Some((room_id, agent_id)) = session.bound.take() {
                state.registry.leave_session(&room_id, &agent_id, session.id).await;
            }
        }
        SignalMessage::Ping => {
            session.handle.deliver(SignalMessage::Pong);
        }
        other => log::debug!("Session {}: ignoring client-sent {}", session.id, other.name()),
    }
}
