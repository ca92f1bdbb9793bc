//! In-process transport for tests and simulations.
//!
//! All connections created from one [`MemoryNetwork`] share a hub. An attempt
//! opens once the initiator has applied the answer *and* the responder has
//! applied the initiator's candidate, mirroring a real connectivity check.
//! The hub records every offer and every established pair, and can stall a
//! peer (it refuses every offer) or sever live links.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use swarmtech_core::AgentId;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{PeerChannel, PeerConnection, Transport, TransportError, TransportEvent, TransportState};

const OFFER_PREFIX: &str = "mem-offer:";
const ANSWER_PREFIX: &str = "mem-answer:";
const CANDIDATE_PREFIX: &str = "mem-candidate:";
const EVENT_CAPACITY: usize = 32;

struct Pending {
    initiator: AgentId,
    responder: AgentId,
    initiator_events: mpsc::Sender<TransportEvent>,
    responder_events: Option<mpsc::Sender<TransportEvent>>,
    answered: bool,
    candidate_applied: bool,
}

struct Active {
    token: String,
    initiator: AgentId,
    responder: AgentId,
    initiator_events: mpsc::Sender<TransportEvent>,
    responder_events: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct Hub {
    pending: HashMap<String, Pending>,
    active: Vec<Active>,
    established: Vec<(AgentId, AgentId)>,
    offers: Vec<(AgentId, AgentId)>,
    stalled: HashSet<AgentId>,
}

/// Shared hub for [`MemoryTransport`]s.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
    channel_capacity: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryNetwork {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            channel_capacity,
        }
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { network: self.clone() }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A stalled peer refuses every offer, so its initiators never hear back.
    pub fn set_stalled(&self, peer: &str, stalled: bool) {
        let mut hub = self.hub();
        if stalled {
            hub.stalled.insert(peer.to_string());
        } else {
            hub.stalled.remove(peer);
        }
    }

    /// Fail every live link between `a` and `b`. Returns how many were cut.
    pub fn sever(&self, a: &str, b: &str) -> usize {
        let mut hub = self.hub();
        let (cut, kept): (Vec<Active>, Vec<Active>) = hub.active.drain(..).partition(|link| {
            (link.initiator == a && link.responder == b) || (link.initiator == b && link.responder == a)
        });
        hub.active = kept;
        for link in &cut {
            let _ = link.initiator_events.try_send(TransportEvent::StateChanged(TransportState::Failed));
            let _ = link.responder_events.try_send(TransportEvent::StateChanged(TransportState::Failed));
        }
        cut.len()
    }

    /// Offers created from `from` to `to`, counting retries.
    pub fn offers_between(&self, from: &str, to: &str) -> usize {
        self.hub().offers.iter().filter(|(f, t)| f == from && t == to).count()
    }

    /// Every (initiator, responder) pair that ever opened, in order.
    pub fn established(&self) -> Vec<(AgentId, AgentId)> {
        self.hub().established.clone()
    }

    pub fn active_links(&self) -> usize {
        self.hub().active.len()
    }

    fn open_if_ready(&self, hub: &mut Hub, token: &str) {
        let ready = hub
            .pending
            .get(token)
            .is_some_and(|p| p.answered && p.candidate_applied && p.responder_events.is_some());
        if !ready {
            return;
        }
        let Some(pending) = hub.pending.remove(token) else {
            return;
        };
        let Some(responder_events) = pending.responder_events else {
            return;
        };

        let (initiator_end, responder_end) = PeerChannel::pair(self.channel_capacity);
        for (events, end) in [(&pending.initiator_events, initiator_end), (&responder_events, responder_end)] {
            let _ = events.try_send(TransportEvent::StateChanged(TransportState::Connected));
            let _ = events.try_send(TransportEvent::ChannelOpen(end));
        }

        log::debug!("memory link {} -> {} open", pending.initiator, pending.responder);
        hub.established.push((pending.initiator.clone(), pending.responder.clone()));
        hub.active.push(Active {
            token: token.to_string(),
            initiator: pending.initiator,
            responder: pending.responder,
            initiator_events: pending.initiator_events,
            responder_events,
        });
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    fn connect(&self, local: &AgentId, remote: &AgentId) -> (MemoryConnection, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let conn = MemoryConnection {
            network: self.network.clone(),
            local: local.clone(),
            remote: remote.clone(),
            events,
            phase: Phase::Idle,
        };
        (conn, rx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Offered(String),
    Answered(String),
    Closed,
}

pub struct MemoryConnection {
    network: MemoryNetwork,
    local: AgentId,
    remote: AgentId,
    events: mpsc::Sender<TransportEvent>,
    phase: Phase,
}

fn strip<'a>(value: &'a str, prefix: &str) -> Result<&'a str, TransportError> {
    value
        .strip_prefix(prefix)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| TransportError::MalformedDescription(value.to_string()))
}

impl PeerConnection for MemoryConnection {
    async fn create_offer(&mut self) -> Result<String, TransportError> {
        if self.phase != Phase::Idle {
            return Err(TransportError::WrongPhase("create_offer"));
        }
        let token = Uuid::new_v4().to_string();
        {
            let mut hub = self.network.hub();
            hub.offers.push((self.local.clone(), self.remote.clone()));
            hub.pending.insert(
                token.clone(),
                Pending {
                    initiator: self.local.clone(),
                    responder: self.remote.clone(),
                    initiator_events: self.events.clone(),
                    responder_events: None,
                    answered: false,
                    candidate_applied: false,
                },
            );
        }
        let _ = self.events.try_send(TransportEvent::StateChanged(TransportState::Connecting));
        let _ = self.events.try_send(TransportEvent::LocalCandidate(format!("{CANDIDATE_PREFIX}{token}")));
        self.phase = Phase::Offered(token.clone());
        Ok(format!("{OFFER_PREFIX}{token}"))
    }

    async fn accept_offer(&mut self, offer: &str) -> Result<String, TransportError> {
        if self.phase != Phase::Idle {
            return Err(TransportError::WrongPhase("accept_offer"));
        }
        let token = strip(offer, OFFER_PREFIX)?.to_string();
        let mut hub = self.network.hub();
        if hub.stalled.contains(&self.local) {
            return Err(TransportError::Refused(format!("{} is stalled", self.local)));
        }
        let pending = hub
            .pending
            .get_mut(&token)
            .filter(|p| p.responder == self.local && p.initiator == self.remote)
            .ok_or(TransportError::StaleDescription)?;
        pending.responder_events = Some(self.events.clone());
        let _ = self.events.try_send(TransportEvent::StateChanged(TransportState::Connecting));
        self.phase = Phase::Answered(token.clone());
        Ok(format!("{ANSWER_PREFIX}{token}"))
    }

    async fn apply_answer(&mut self, answer: &str) -> Result<(), TransportError> {
        let Phase::Offered(own) = &self.phase else {
            return Err(TransportError::WrongPhase("apply_answer"));
        };
        let token = strip(answer, ANSWER_PREFIX)?;
        if token != own.as_str() {
            return Err(TransportError::StaleDescription);
        }
        let mut hub = self.network.hub();
        let pending = hub.pending.get_mut(token).ok_or(TransportError::StaleDescription)?;
        pending.answered = true;
        self.network.open_if_ready(&mut hub, token);
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: &str) -> Result<(), TransportError> {
        let token = match &self.phase {
            // The responder never gathers candidates of its own.
            Phase::Offered(_) => return Ok(()),
            Phase::Answered(token) => token,
            Phase::Idle | Phase::Closed => return Err(TransportError::WrongPhase("add_candidate")),
        };
        let got = candidate
            .strip_prefix(CANDIDATE_PREFIX)
            .ok_or_else(|| TransportError::MalformedCandidate(candidate.to_string()))?;
        if got != token.as_str() {
            return Err(TransportError::StaleDescription);
        }
        let mut hub = self.network.hub();
        if let Some(pending) = hub.pending.get_mut(token.as_str()) {
            pending.candidate_applied = true;
        }
        self.network.open_if_ready(&mut hub, token);
        Ok(())
    }

    fn close(&mut self) {
        let token = match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Offered(token) | Phase::Answered(token) => token,
            Phase::Idle | Phase::Closed => return,
        };
        let mut hub = self.network.hub();
        hub.pending.remove(&token);
        hub.active.retain(|link| link.token != token);
    }
}
