//! In-memory room table for the signaling relay.
//!
//! Each room maps agent ids to the agent record plus a handle on the
//! session currently bound to that id. Every mutation holds the table's
//! write lock for its whole read-modify-write, so concurrent join/leave
//! cannot lose updates, and notifications are queued to member sessions
//! before the lock is released (members observe joins and leaves in the
//! order they happened).
//!
//! Delivery never blocks. A session whose outbound queue is full is flagged
//! as overflowed and its connection is closed, so the client sees a
//! disconnect instead of a silently missing notification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use swarmtech_core::{now_millis, Agent, AgentId};
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::protocol::{SignalKind, SignalMessage};

/// Identifier of one transport connection to the relay.
pub type SessionId = Uuid;

/// Outbound side of a relay session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    tx: mpsc::Sender<SignalMessage>,
    overflow: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(id: SessionId, tx: mpsc::Sender<SignalMessage>) -> Self {
        Self { id, tx, overflow: Arc::new(Notify::new()) }
    }

    /// Queue a frame for this session. Returns `false` if it was not queued;
    /// a full queue also marks the session overflowed.
    pub fn deliver(&self, msg: SignalMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                log::warn!("Session {} outbound queue full at {}, closing it", self.id, msg.name());
                self.overflow.notify_one();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Resolves once a frame could not be queued. The owner must then close
    /// the connection.
    pub async fn overflowed(&self) {
        self.overflow.notified().await;
    }
}

struct Member {
    agent: Agent,
    session: SessionHandle,
}

struct Room {
    id: String,
    name: String,
    created_at: u64,
    members: HashMap<AgentId, Member>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            created_at: now_millis(),
            members: HashMap::new(),
        }
    }

    fn broadcast_except(&self, except: &str, msg: &SignalMessage) {
        for (id, member) in &self.members {
            if id != except {
                member.session.deliver(msg.clone());
            }
        }
    }
}

/// Public room summary served over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    pub peer_count: usize,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub rooms: usize,
    pub members: usize,
    pub relayed: u64,
    pub dropped: u64,
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    relayed: AtomicU64,
    dropped: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `agent` to `room_id`, creating the room if needed.
    ///
    /// The joining session receives `room-peers` (everyone but itself) and
    /// every other member receives `peer-joined`. Joining again with the same
    /// agent id replaces the previous entry and its session binding.
    pub async fn join(&self, room_id: &str, agent: Agent, session: SessionHandle) -> Vec<Agent> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_insert_with(|| {
            log::info!("Room created: {room_id}");
            Room::new(room_id)
        });

        let peers: Vec<Agent> = room
            .members
            .values()
            .filter(|m| m.agent.id != agent.id)
            .map(|m| m.agent.clone())
            .collect();

        if let Some(previous) = room.members.get(&agent.id) {
            if previous.session.id != session.id {
                log::debug!(
                    "Agent {} rebinding in room {room_id}: session {} replaces {}",
                    agent.id,
                    session.id,
                    previous.session.id
                );
            }
        }

        session.deliver(SignalMessage::RoomPeers {
            room_id: room_id.to_string(),
            peers: peers.clone(),
        });
        room.broadcast_except(
            &agent.id,
            &SignalMessage::PeerJoined { room_id: room_id.to_string(), peer: agent.clone() },
        );

        let agent_id = agent.id.clone();
        let name = agent.name.clone();
        room.members.insert(agent_id, Member { agent, session });
        log::info!(
            "Agent {name} joined room {room_id}. Total peers: {}",
            room.members.len()
        );
        peers
    }

    /// Forward a handshake payload to `to`'s current session.
    ///
    /// Returns `false` when there is no such member; the frame is dropped
    /// and nothing is reported to the sender.
    pub async fn relay(&self, room_id: &str, kind: SignalKind, from: &str, to: &str, payload: String) -> bool {
        let rooms = self.rooms.read().await;
        let target = rooms.get(room_id).and_then(|room| room.members.get(to));

        let delivered = match target {
            Some(member) => member.session.deliver(SignalMessage::relayed(kind, from, to, payload)),
            None => {
                log::debug!("Dropping {kind:?} from {from}: {to} not in room {room_id}");
                false
            }
        };

        let counter = if delivered { &self.relayed } else { &self.dropped };
        counter.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Remove `agent_id` regardless of which session bound it.
    pub async fn leave(&self, room_id: &str, agent_id: &str) -> bool {
        self.remove(room_id, agent_id, None).await
    }

    /// Remove `agent_id` only if `session_id` is still its binding. A
    /// superseded session closing must not evict the agent's new session.
    pub async fn leave_session(&self, room_id: &str, agent_id: &str, session_id: SessionId) -> bool {
        self.remove(room_id, agent_id, Some(session_id)).await
    }

    async fn remove(&self, room_id: &str, agent_id: &str, session_id: Option<SessionId>) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };

        let bound = room.members.get(agent_id).map(|m| m.session.id);
        match (bound, session_id) {
            (None, _) => return false,
            (Some(current), Some(expected)) if current != expected => {
                log::debug!("Ignoring leave of {agent_id} from superseded session {expected}");
                return false;
            }
            _ => {}
        }

        room.members.remove(agent_id);
        room.broadcast_except(
            agent_id,
            &SignalMessage::PeerLeft { room_id: room_id.to_string(), peer_id: agent_id.to_string() },
        );
        log::info!(
            "Agent {agent_id} left room {room_id}. Remaining peers: {}",
            room.members.len()
        );

        if room.members.is_empty() {
            rooms.remove(room_id);
            log::info!("Room {room_id} deleted (empty)");
        }
        true
    }

    pub async fn room_info(&self, room_id: &str) -> Option<RoomInfo> {
        self.rooms.read().await.get(room_id).map(|room| RoomInfo {
            id: room.id.clone(),
            name: room.name.clone(),
            peer_count: room.members.len(),
            created_at: room.created_at,
        })
    }

    /// Agents currently in a room.
    pub async fn members(&self, room_id: &str) -> Vec<Agent> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|room| room.members.values().map(|m| m.agent.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let rooms = self.rooms.read().await;
        RegistryStats {
            rooms: rooms.len(),
            members: rooms.values().map(|r| r.members.len()).sum(),
            relayed: self.relayed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
