//! Connection manager: one link per remote peer.
//!
//! Only the joining peer initiates. `room-peers` spawns an initiator link for
//! every member already present; an incoming `offer` spawns (or restarts) a
//! responder link. Existing members never initiate towards a newcomer, so
//! each unordered pair ends up with exactly one link whatever the join order.
//!
//! Links are tagged with a generation. Events from a replaced link carry an
//! old generation and are ignored.

use std::collections::HashMap;
use std::sync::Arc;

use swarmtech_core::{Agent, AgentId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::link::{LinkCommand, LinkDriver, LinkEvent, LinkRole, LinkState};
use crate::signaling::SignalSender;
use crate::transport::Transport;

/// Candidates kept per unknown peer until its offer shows up.
const EARLY_CANDIDATE_LIMIT: usize = 16;

struct LinkHandle {
    generation: u64,
    role: LinkRole,
    state: LinkState,
    commands: mpsc::Sender<LinkCommand>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    fn send(&self, command: LinkCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Link command dropped: {e}");
                false
            }
        }
    }

    /// Ask the driver to close; abort it if it cannot be reached.
    fn close(&self) -> bool {
        if self.commands.try_send(LinkCommand::Close).is_ok() {
            return true;
        }
        self.task.abort();
        false
    }
}

/// Snapshot of one link for callers outside the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub peer: AgentId,
    pub role: LinkRole,
    pub state: LinkState,
    pub generation: u64,
}

pub struct ConnectionManager<T: Transport> {
    local_id: AgentId,
    transport: Arc<T>,
    config: MeshConfig,
    signals: SignalSender,
    events: mpsc::Sender<LinkEvent>,
    links: HashMap<AgentId, LinkHandle>,
    early_candidates: HashMap<AgentId, Vec<String>>,
    next_generation: u64,
}

impl<T: Transport> ConnectionManager<T> {
    pub(crate) fn new(
        local_id: AgentId,
        transport: Arc<T>,
        config: MeshConfig,
        signals: SignalSender,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            local_id,
            transport,
            config,
            signals,
            events,
            links: HashMap::new(),
            early_candidates: HashMap::new(),
            next_generation: 0,
        }
    }

    fn spawn(&mut self, peer: &str, role: LinkRole, offer: Option<String>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let (commands, rx) = mpsc::channel(self.config.channel_capacity);

        if role == LinkRole::Responder {
            for candidate in self.early_candidates.remove(peer).unwrap_or_default() {
                let _ = commands.try_send(LinkCommand::RemoteCandidate(candidate));
            }
        }

        let driver = LinkDriver {
            transport: self.transport.clone(),
            local: self.local_id.clone(),
            peer: peer.to_string(),
            generation,
            role,
            handshake_timeout: self.config.handshake_timeout,
            retries: self.config.handshake_retries,
            signals: self.signals.clone(),
            events: self.events.clone(),
            commands: rx,
            state: LinkState::Discovered,
            pending_candidates: Vec::new(),
        };
        let task = tokio::spawn(driver.run(offer));

        log::debug!("Link {} -> {peer}: spawned {role:?} (generation {generation})", self.local_id);
        let handle = LinkHandle { generation, role, state: LinkState::Discovered, commands, task };
        if let Some(previous) = self.links.insert(peer.to_string(), handle) {
            previous.close();
        }
    }

    /// We just joined: initiate towards everyone already present.
    pub(crate) fn on_room_peers(&mut self, peers: &[Agent]) {
        for peer in peers {
            if peer.id == self.local_id || self.links.contains_key(&peer.id) {
                continue;
            }
            self.spawn(&peer.id, LinkRole::Initiator, None);
        }
    }

    pub(crate) fn on_offer(&mut self, from: &str, sdp: String) {
        if from == self.local_id {
            return;
        }
        let restartable = self
            .links
            .get(from)
            .filter(|link| link.role == LinkRole::Responder && link.state.is_handshaking());

        match restartable {
            Some(link) => {
                if !link.send(LinkCommand::RemoteOffer(sdp.clone())) {
                    self.spawn(from, LinkRole::Responder, Some(sdp));
                }
            }
            None => {
                if self.links.contains_key(from) {
                    log::info!("Peer {from} sent a new offer, replacing its link");
                }
                self.spawn(from, LinkRole::Responder, Some(sdp));
            }
        }
    }

    pub(crate) fn on_answer(&mut self, from: &str, sdp: String) {
        match self.links.get(from) {
            Some(link) => {
                link.send(LinkCommand::RemoteAnswer(sdp));
            }
            None => log::debug!("Dropping answer from {from}: no link"),
        }
    }

    pub(crate) fn on_candidate(&mut self, from: &str, candidate: String) {
        if let Some(link) = self.links.get(from) {
            link.send(LinkCommand::RemoteCandidate(candidate));
            return;
        }
        let early = self.early_candidates.entry(from.to_string()).or_default();
        if early.len() < EARLY_CANDIDATE_LIMIT {
            early.push(candidate);
        }
    }

    /// The relay saw `peer` go. Its link, if any, closes.
    pub(crate) fn on_peer_left(&mut self, peer: &str) {
        self.early_candidates.remove(peer);
        let unreachable = self.links.get(peer).is_some_and(|link| !link.close());
        if unreachable {
            self.links.remove(peer);
        }
    }

    /// Record a state change. Returns `false` for events from replaced links.
    pub(crate) fn on_link_state(&mut self, peer: &str, generation: u64, state: LinkState) -> bool {
        let Some(link) = self.links.get_mut(peer).filter(|l| l.generation == generation) else {
            return false;
        };
        if state == LinkState::Closed {
            self.links.remove(peer);
        } else {
            link.state = state;
        }
        true
    }

    pub(crate) fn is_current(&self, peer: &str, generation: u64) -> bool {
        self.links.get(peer).is_some_and(|l| l.generation == generation)
    }

    pub fn link_state(&self, peer: &str) -> Option<LinkState> {
        self.links.get(peer).map(|l| l.state)
    }

    /// Peers with an open link, sorted.
    pub fn open_links(&self) -> Vec<AgentId> {
        let mut peers: Vec<AgentId> = self
            .links
            .iter()
            .filter(|(_, l)| l.state == LinkState::Open)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = self
            .links
            .iter()
            .map(|(peer, l)| LinkInfo { peer: peer.clone(), role: l.role, state: l.state, generation: l.generation })
            .collect();
        links.sort_by(|a, b| a.peer.cmp(&b.peer));
        links
    }

    pub(crate) fn close_all(&mut self) {
        self.early_candidates.clear();
        for (_, link) in self.links.drain() {
            link.close();
        }
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        for link in self.links.values() {
            link.task.abort();
        }
    }
}
