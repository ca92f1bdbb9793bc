//! One device's participation in a room.
//!
//! ```text
//!  local API ──▶ ReplicatedDocument ──delta──▶ Propagator ──▶ open links
//!                      ▲                            ▲
//!   link frames ──merge┘── changed? ──rebroadcast───┘ (except origin)
//!
//!  relay ◀──▶ SignalClient ◀──▶ event loop ──▶ ConnectionManager ──▶ link tasks
//! ```
//!
//! A single event loop task handles signaling, link events and remote
//! frames, so remote merges are serialized. Local mutations take the same
//! document lock. Lock order is always document, then propagator, which also
//! guarantees that a link's bootstrap snapshot is queued before any delta
//! produced after it.

use std::collections::BTreeMap;
use std::sync::Arc;

use swarmtech_core::{
    is_valid_room_id, Agent, AgentId, AgentLocation, ChatMessage, DocumentView, LocationOptions,
    MessageKind, ReplicatedDocument, SubscriptionId,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::link::{LinkEvent, LinkState};
use crate::manager::{ConnectionManager, LinkInfo};
use crate::propagator::Propagator;
use crate::protocol::SignalMessage;
use crate::signaling::{SignalClient, SignalEvent};
use crate::transport::Transport;

const EVENT_CAPACITY: usize = 256;

/// Notifications for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LinkOpened(AgentId),
    LinkClosed(AgentId),
    /// A peer is (or became) present in the room.
    PeerJoined(Agent),
    PeerLeft(AgentId),
    /// The relay connection dropped. Open links keep working.
    SignalingLost,
}

struct Running<T: Transport> {
    room_id: String,
    manager: Arc<Mutex<ConnectionManager<T>>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl<T: Transport> Drop for Running<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct SwarmSession<T: Transport> {
    agent: Agent,
    config: MeshConfig,
    transport: Arc<T>,
    document: Arc<Mutex<ReplicatedDocument>>,
    propagator: Arc<Mutex<Propagator>>,
    running: Mutex<Option<Running<T>>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl<T: Transport> SwarmSession<T> {
    pub fn create(agent: Agent, config: MeshConfig, transport: T) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            document: Arc::new(Mutex::new(ReplicatedDocument::new(agent.id.clone()))),
            agent,
            config,
            transport: Arc::new(transport),
            propagator: Arc::new(Mutex::new(Propagator::new())),
            running: Mutex::new(None),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Join `room_id` through the relay at `url` and start forming the mesh.
    pub async fn connect_to_room(&self, url: &str, room_id: &str) -> Result<(), MeshError> {
        if !is_valid_room_id(room_id) {
            return Err(MeshError::InvalidRoomId(room_id.to_string()));
        }
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Err(MeshError::AlreadyConnected(current.room_id.clone()));
        }

        let (client, signal_rx) =
            SignalClient::connect(url, self.agent.id.clone(), self.config.signaling_capacity).await?;

        // Our own roster entry travels in every snapshot we send.
        self.upsert_agent(self.agent.clone()).await?;

        let (link_tx, link_rx) = mpsc::channel(self.config.channel_capacity);
        let manager = Arc::new(Mutex::new(ConnectionManager::new(
            self.agent.id.clone(),
            self.transport.clone(),
            self.config.clone(),
            client.sender(),
            link_tx,
        )));
        client.join_room(room_id, &self.agent).await?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let event_loop = EventLoop {
            local_id: self.agent.id.clone(),
            document: self.document.clone(),
            propagator: self.propagator.clone(),
            manager: manager.clone(),
            events: self.events_tx.clone(),
        };
        let task = tokio::spawn(event_loop.run(client, signal_rx, link_rx, shutdown_rx));

        log::info!("Agent {} joining room {room_id}", self.agent.id);
        *running = Some(Running {
            room_id: room_id.to_string(),
            manager,
            shutdown: Some(shutdown_tx),
            task,
        });
        Ok(())
    }

    /// Close every link, leave the room and release the relay connection.
    /// The document is kept; the session may connect again.
    pub async fn shutdown(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };
        if let Some(shutdown) = running.shutdown.take() {
            let _ = shutdown.send(());
        }
        let task = &mut running.task;
        if tokio::time::timeout(std::time::Duration::from_secs(2), task).await.is_err() {
            log::warn!("Session event loop did not stop in time");
        }
        log::info!("Agent {} left room {}", self.agent.id, running.room_id);
    }

    pub async fn room_id(&self) -> Option<String> {
        self.running.lock().await.as_ref().map(|r| r.room_id.clone())
    }

    // ─────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────

    async fn apply_local(
        &self,
        mutate: impl FnOnce(&mut ReplicatedDocument) -> Result<Vec<u8>, swarmtech_core::DocumentError>,
    ) -> Result<(), MeshError> {
        let mut document = self.document.lock().await;
        let frame = mutate(&mut *document)?;
        let sent = self.propagator.lock().await.broadcast(&frame, None);
        log::trace!("Local delta ({} bytes) queued on {sent} links", frame.len());
        Ok(())
    }

    pub async fn upsert_agent(&self, agent: Agent) -> Result<(), MeshError> {
        self.apply_local(|doc| doc.upsert_agent(agent)).await
    }

    pub async fn upsert_location(&self, agent_id: &str, location: AgentLocation) -> Result<(), MeshError> {
        self.apply_local(|doc| doc.upsert_location(agent_id, location)).await
    }

    /// Publish a fresh location sample for the local agent.
    pub async fn update_location(&self, longitude: f64, latitude: f64, options: LocationOptions) -> Result<(), MeshError> {
        let location = AgentLocation::new(self.agent.id.clone(), longitude, latitude, options);
        self.upsert_location(&self.agent.id, location).await
    }

    pub async fn append_message(&self, message: ChatMessage) -> Result<(), MeshError> {
        self.apply_local(|doc| doc.append_message(message)).await
    }

    /// Author a message as the local agent.
    pub async fn send_message(&self, content: &str, kind: MessageKind) -> Result<(), MeshError> {
        self.append_message(ChatMessage::new(&self.agent, content, kind)).await
    }

    /// Tombstone an agent and its location on every replica.
    pub async fn remove_agent(&self, agent_id: &str) -> Result<(), MeshError> {
        self.apply_local(|doc| doc.remove_agent(agent_id)).await
    }

    // ─────────────────────────────────────────────────────────
    // Reads and observers
    // ─────────────────────────────────────────────────────────

    pub async fn agents(&self) -> BTreeMap<AgentId, Agent> {
        self.document.lock().await.agents()
    }

    pub async fn locations(&self) -> BTreeMap<AgentId, AgentLocation> {
        self.document.lock().await.locations()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.document.lock().await.messages()
    }

    pub async fn view(&self) -> DocumentView {
        self.document.lock().await.view()
    }

    /// Full-state encoding of the local document.
    pub async fn snapshot(&self) -> Result<Vec<u8>, MeshError> {
        Ok(self.document.lock().await.encode_snapshot()?)
    }

    /// Callbacks run while the document is locked and must not call back
    /// into the session.
    pub async fn on_agents_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&BTreeMap<AgentId, Agent>) + Send + Sync + 'static,
    {
        self.document.lock().await.on_agents_change(callback)
    }

    pub async fn on_locations_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&BTreeMap<AgentId, AgentLocation>) + Send + Sync + 'static,
    {
        self.document.lock().await.on_locations_change(callback)
    }

    pub async fn on_messages_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&[ChatMessage]) + Send + Sync + 'static,
    {
        self.document.lock().await.on_messages_change(callback)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.document.lock().await.unsubscribe(id)
    }

    // ─────────────────────────────────────────────────────────
    // Links
    // ─────────────────────────────────────────────────────────

    async fn manager(&self) -> Option<Arc<Mutex<ConnectionManager<T>>>> {
        self.running.lock().await.as_ref().map(|r| r.manager.clone())
    }

    /// Peers with an open link, sorted.
    pub async fn open_links(&self) -> Vec<AgentId> {
        match self.manager().await {
            Some(manager) => manager.lock().await.open_links(),
            None => Vec::new(),
        }
    }

    pub async fn link_state(&self, peer: &str) -> Option<LinkState> {
        self.manager().await?.lock().await.link_state(peer)
    }

    pub async fn links(&self) -> Vec<LinkInfo> {
        match self.manager().await {
            Some(manager) => manager.lock().await.links(),
            None => Vec::new(),
        }
    }
}

struct EventLoop<T: Transport> {
    local_id: AgentId,
    document: Arc<Mutex<ReplicatedDocument>>,
    propagator: Arc<Mutex<Propagator>>,
    manager: Arc<Mutex<ConnectionManager<T>>>,
    events: mpsc::Sender<SessionEvent>,
}

impl<T: Transport> EventLoop<T> {
    async fn run(
        self,
        client: SignalClient,
        signal_rx: mpsc::Receiver<SignalEvent>,
        mut link_rx: mpsc::Receiver<LinkEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut signal_rx = Some(signal_rx);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                signal = async {
                    match signal_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match signal {
                    Some(SignalEvent::Message(msg)) => self.on_signal(msg).await,
                    Some(SignalEvent::Disconnected) | None => {
                        log::warn!("Agent {} lost the relay connection", self.local_id);
                        signal_rx = None;
                        self.emit(SessionEvent::SignalingLost);
                    }
                },
                Some(event) = link_rx.recv() => self.on_link_event(event).await,
            }
        }

        self.manager.lock().await.close_all();
        self.propagator.lock().await.clear();
        let _ = client.leave_room().await;
        client.close().await;
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.try_send(event).is_err() {
            log::trace!("Session event dropped (receiver full or gone)");
        }
    }

    async fn on_signal(&self, msg: SignalMessage) {
        match msg {
            SignalMessage::RoomPeers { room_id, peers } => {
                log::info!("Agent {} joined room {room_id} with {} peers", self.local_id, peers.len());
                self.manager.lock().await.on_room_peers(&peers);
                for peer in peers {
                    self.emit(SessionEvent::PeerJoined(peer));
                }
            }
            SignalMessage::PeerJoined { peer, .. } => {
                log::info!("Peer {} ({}) joined", peer.name, peer.id);
                self.emit(SessionEvent::PeerJoined(peer));
            }
            SignalMessage::PeerLeft { peer_id, .. } => {
                log::info!("Peer {peer_id} left");
                self.manager.lock().await.on_peer_left(&peer_id);
                self.emit(SessionEvent::PeerLeft(peer_id));
            }
            SignalMessage::Offer { from, sdp, .. } => self.manager.lock().await.on_offer(&from, sdp),
            SignalMessage::Answer { from, sdp, .. } => self.manager.lock().await.on_answer(&from, sdp),
            SignalMessage::IceCandidate { from, candidate, .. } => {
                self.manager.lock().await.on_candidate(&from, candidate)
            }
            SignalMessage::Pong => log::trace!("Relay pong"),
            other => log::debug!("Ignoring {} from relay", other.name()),
        }
    }

    async fn on_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::State { peer, generation, state } => {
                let current = self.manager.lock().await.on_link_state(&peer, generation, state);
                if state == LinkState::Closed {
                    self.propagator.lock().await.remove(&peer, generation);
                    if current {
                        log::info!("Link to {peer} closed");
                        self.emit(SessionEvent::LinkClosed(peer));
                    }
                }
            }
            LinkEvent::Opened { peer, generation, tx } => {
                if !self.manager.lock().await.is_current(&peer, generation) {
                    return;
                }
                let document = self.document.lock().await;
                let snapshot = match document.encode_snapshot() {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        log::error!("Failed to encode snapshot for {peer}: {e}");
                        return;
                    }
                };
                let mut propagator = self.propagator.lock().await;
                propagator.insert(peer.clone(), generation, tx);
                if !propagator.send_to(&peer, &snapshot) {
                    log::warn!("Could not queue bootstrap snapshot for {peer}");
                }
                drop(propagator);
                drop(document);

                log::info!("Link to {peer} open, sent {} byte snapshot", snapshot.len());
                self.emit(SessionEvent::LinkOpened(peer));
            }
            LinkEvent::Frame { peer, generation, bytes } => {
                // A replaced link's late frames would rebroadcast past its successor.
                if !self.manager.lock().await.is_current(&peer, generation) {
                    log::debug!("Dropping frame from superseded link to {peer}");
                    return;
                }
                self.merge_remote(&peer, &bytes).await
            }
        }
    }

    async fn merge_remote(&self, peer: &str, bytes: &[u8]) {
        let mut document = self.document.lock().await;
        let outcome = match document.merge(bytes) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Rejected frame from {peer}: {e}");
                return;
            }
        };
        if !outcome.is_changed() {
            return;
        }
        match outcome.rebroadcast_frame() {
            Ok(Some(frame)) => {
                let sent = self.propagator.lock().await.broadcast(&frame, Some(peer));
                log::trace!("Rebroadcast {} changed entries from {peer} to {sent} links", outcome.changed.len());
            }
            Ok(None) => {}
            Err(e) => log::error!("Failed to encode rebroadcast: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{Outgoing, SignalSender};
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use swarmtech_core::Role;

    type Harness = (EventLoop<MemoryTransport>, mpsc::Receiver<LinkEvent>, mpsc::Receiver<Outgoing>);

    fn event_loop(local: &str) -> Harness {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (link_tx, link_rx) = mpsc::channel(64);
        let (events, _) = mpsc::channel(64);
        let manager = ConnectionManager::new(
            local.to_string(),
            Arc::new(MemoryNetwork::default().transport()),
            MeshConfig::default(),
            SignalSender::for_tests(local, out_tx),
            link_tx,
        );
        let event_loop = EventLoop {
            local_id: local.to_string(),
            document: Arc::new(Mutex::new(ReplicatedDocument::new(local.to_string()))),
            propagator: Arc::new(Mutex::new(Propagator::new())),
            manager: Arc::new(Mutex::new(manager)),
            events,
        };
        (event_loop, link_rx, out_rx)
    }

    #[tokio::test]
    async fn test_frames_from_superseded_link_ignored() {
        let (event_loop, _links, _signals) = event_loop("a");
        event_loop.manager.lock().await.on_room_peers(&[Agent::with_id("b", "B", Role::Field)]);
        let current = event_loop.manager.lock().await.links()[0].generation;

        let mut remote = ReplicatedDocument::new("b".to_string());
        let late = remote.upsert_agent(Agent::with_id("b", "B", Role::Field)).unwrap();
        let fresh = remote.upsert_agent(Agent::with_id("hq", "Dispatch", Role::Command)).unwrap();

        let frame = |generation, bytes| LinkEvent::Frame { peer: "b".to_string(), generation, bytes };
        event_loop.on_link_event(frame(current + 7, late)).await;
        assert!(event_loop.document.lock().await.agents().is_empty());

        event_loop.on_link_event(frame(current, fresh)).await;
        let agents = event_loop.document.lock().await.agents();
        assert!(agents.contains_key("hq"));
        assert!(!agents.contains_key("b"));
    }
}
