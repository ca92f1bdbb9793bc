//! Replicated document: agent roster, location table, and message log.
//!
//! ```text
//!  local call ──► upsert_agent / upsert_location / append_message
//!                        │
//!                        ▼
//!               apply(entries) ──► observers
//!                        │
//!                        ▼
//!                 Frame::delta ──► Propagator ──► every open link
//!
//!  remote bytes ──► merge() ──► Frame::decode (all-or-nothing)
//!                        │
//!                        ▼
//!               apply(entries) ──► changed entries ──► re-broadcast
//! ```
//!
//! Every table is a state-based CRDT: applying the same frame twice, or a
//! set of frames in any order, yields the same state. The document is not
//! internally synchronized; callers serialize access (the mesh session keeps
//! it behind a single mutex).
//!
//! Reference: Shapiro et al., "Conflict-free Replicated Data Types" (2011)

pub mod log;
pub mod lww;
pub mod observer;
pub mod wire;

use std::collections::BTreeMap;

use crate::error::DocumentError;
use crate::types::{Agent, AgentId, AgentLocation, ChatMessage};
use crate::utils::now_millis;

pub use self::log::{LogEntry, MessageLog};
pub use self::lww::{LwwRegister, Stamp};
pub use self::observer::{SubscriptionId, Touched};
pub use self::wire::{Entry, Frame, FrameKind};

/// Result of merging remote bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub kind: FrameKind,
    /// Entries that changed local state, in frame order.
    pub changed: Vec<Entry>,
    /// Entries that were already known (duplicates or stale writes).
    pub ignored: usize,
}

impl MergeOutcome {
    pub fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }

    /// Delta frame carrying only what changed, for epidemic re-broadcast.
    pub fn rebroadcast_frame(&self) -> Result<Option<Vec<u8>>, DocumentError> {
        if self.changed.is_empty() {
            return Ok(None);
        }
        Frame::delta(self.changed.clone()).encode().map(Some)
    }
}

/// Materialized view, comparable across replicas.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentView {
    pub agents: BTreeMap<AgentId, Agent>,
    pub locations: BTreeMap<AgentId, AgentLocation>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug)]
pub struct ReplicatedDocument {
    /// Writer identity for locally produced stamps.
    local_id: AgentId,
    agents: BTreeMap<AgentId, LwwRegister<Agent>>,
    locations: BTreeMap<AgentId, LwwRegister<AgentLocation>>,
    log: MessageLog,
    observers: observer::Observers,
}

impl ReplicatedDocument {
    pub fn new(local_id: impl Into<AgentId>) -> Self {
        Self {
            local_id: local_id.into(),
            agents: BTreeMap::new(),
            locations: BTreeMap::new(),
            log: MessageLog::new(),
            observers: observer::Observers::default(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    // ───────────────────────────────────────────────────────────────
    // Local mutations
    // ───────────────────────────────────────────────────────────────

    /// Insert or replace an agent record. Returns the delta to broadcast.
    pub fn upsert_agent(&mut self, agent: Agent) -> Result<Vec<u8>, DocumentError> {
        let stamp = self.next_agent_stamp(&agent.id);
        let entry = Entry::Agent {
            agent_id: agent.id.clone(),
            register: LwwRegister::new(agent, stamp),
        };
        self.commit_local(entry)
    }

    /// Record a location sample for `agent_id`. The sample's own timestamp
    /// is the LWW clock, so an older sample never replaces a newer one.
    pub fn upsert_location(
        &mut self,
        agent_id: &str,
        mut location: AgentLocation,
    ) -> Result<Vec<u8>, DocumentError> {
        location.agent_id = agent_id.to_string();
        let stamp = Stamp::new(location.timestamp, self.local_id.clone());
        let entry = Entry::Location {
            agent_id: agent_id.to_string(),
            register: LwwRegister::new(location, stamp),
        };
        self.commit_local(entry)
    }

    /// Append a message with the next causal sequence number.
    pub fn append_message(&mut self, message: ChatMessage) -> Result<Vec<u8>, DocumentError> {
        let entry = Entry::Message(LogEntry { seq: self.log.next_seq(), message });
        self.commit_local(entry)
    }

    /// Tombstone an agent and its location. Newer writes resurrect them.
    pub fn remove_agent(&mut self, agent_id: &str) -> Result<Vec<u8>, DocumentError> {
        let agent_stamp = self.next_agent_stamp(agent_id);
        let location_ts = match self.locations.get(agent_id) {
            Some(current) => agent_stamp.timestamp.max(current.stamp.timestamp.saturating_add(1)),
            None => agent_stamp.timestamp,
        };
        let location_stamp = Stamp::new(location_ts, self.local_id.clone());
        let entries = vec![
            Entry::Agent { agent_id: agent_id.to_string(), register: LwwRegister::tombstone(agent_stamp) },
            Entry::Location { agent_id: agent_id.to_string(), register: LwwRegister::tombstone(location_stamp) },
        ];
        let frame = Frame::delta(entries.clone()).encode()?;
        self.apply(entries);
        Ok(frame)
    }

    fn next_agent_stamp(&self, agent_id: &str) -> Stamp {
        let now = now_millis();
        let timestamp = match self.agents.get(agent_id) {
            Some(current) => now.max(current.stamp.timestamp.saturating_add(1)),
            None => now,
        };
        Stamp::new(timestamp, self.local_id.clone())
    }

    fn commit_local(&mut self, entry: Entry) -> Result<Vec<u8>, DocumentError> {
        entry.validate()?;
        let frame = Frame::delta(vec![entry.clone()]).encode()?;
        self.apply(vec![entry]);
        Ok(frame)
    }

    // ───────────────────────────────────────────────────────────────
    // Remote merge
    // ───────────────────────────────────────────────────────────────

    /// Merge a delta or snapshot produced by any replica.
    ///
    /// A frame that fails to decode or validate leaves the document
    /// untouched.
    pub fn merge(&mut self, bytes: &[u8]) -> Result<MergeOutcome, DocumentError> {
        let frame = Frame::decode(bytes).inspect_err(|e| {
            ::log::warn!("Rejected document frame ({} bytes): {e}", bytes.len());
        })?;
        let total = frame.entries.len();
        let changed = self.apply(frame.entries);
        ::log::trace!(
            "Merged {:?} frame: {} changed, {} ignored",
            frame.kind,
            changed.len(),
            total - changed.len()
        );
        Ok(MergeOutcome { kind: frame.kind, ignored: total - changed.len(), changed })
    }

    /// Apply entries and notify observers of the tables that changed.
    fn apply(&mut self, entries: Vec<Entry>) -> Vec<Entry> {
        let mut touched = Touched::default();
        let mut changed = Vec::new();

        for entry in entries {
            let applied = match &entry {
                Entry::Agent { agent_id, register } => {
                    let hit = merge_register(&mut self.agents, agent_id, register);
                    touched.agents |= hit;
                    hit
                }
                Entry::Location { agent_id, register } => {
                    let hit = merge_register(&mut self.locations, agent_id, register);
                    touched.locations |= hit;
                    hit
                }
                Entry::Message(log_entry) => {
                    let hit = self.log.merge(log_entry.clone());
                    touched.messages |= hit;
                    hit
                }
            };
            if applied {
                changed.push(entry);
            }
        }

        self.notify(touched);
        changed
    }

    fn notify(&self, touched: Touched) {
        if touched.agents && self.observers.has_agents() {
            self.observers.notify_agents(&self.agents());
        }
        if touched.locations && self.observers.has_locations() {
            self.observers.notify_locations(&self.locations());
        }
        if touched.messages && self.observers.has_messages() {
            self.observers.notify_messages(&self.messages());
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Snapshots
    // ───────────────────────────────────────────────────────────────

    /// Every entry including tombstones, in a deterministic order.
    pub fn entries(&self) -> Vec<Entry> {
        let agents = self.agents.iter().map(|(id, register)| Entry::Agent {
            agent_id: id.clone(),
            register: register.clone(),
        });
        let locations = self.locations.iter().map(|(id, register)| Entry::Location {
            agent_id: id.clone(),
            register: register.clone(),
        });
        let messages = self.log.entries().cloned().map(Entry::Message);
        agents.chain(locations).chain(messages).collect()
    }

    /// Full-state frame for bootstrapping a peer.
    pub fn encode_snapshot(&self) -> Result<Vec<u8>, DocumentError> {
        Frame::snapshot(self.entries()).encode()
    }

    // ───────────────────────────────────────────────────────────────
    // Materialized views
    // ───────────────────────────────────────────────────────────────

    pub fn agents(&self) -> BTreeMap<AgentId, Agent> {
        live_values(&self.agents)
    }

    pub fn locations(&self) -> BTreeMap<AgentId, AgentLocation> {
        live_values(&self.locations)
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.log.messages()
    }

    pub fn agent(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.get(agent_id).and_then(|r| r.value.as_ref())
    }

    pub fn location(&self, agent_id: &str) -> Option<&AgentLocation> {
        self.locations.get(agent_id).and_then(|r| r.value.as_ref())
    }

    pub fn view(&self) -> DocumentView {
        DocumentView {
            agents: self.agents(),
            locations: self.locations(),
            messages: self.messages(),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Observers
    // ───────────────────────────────────────────────────────────────

    pub fn on_agents_change<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&BTreeMap<AgentId, Agent>) + Send + Sync + 'static,
    {
        self.observers.on_agents(Box::new(callback))
    }

    pub fn on_locations_change<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&BTreeMap<AgentId, AgentLocation>) + Send + Sync + 'static,
    {
        self.observers.on_locations(Box::new(callback))
    }

    pub fn on_messages_change<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&[ChatMessage]) + Send + Sync + 'static,
    {
        self.observers.on_messages(Box::new(callback))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }
}

fn merge_register<T>(
    table: &mut BTreeMap<AgentId, LwwRegister<T>>,
    key: &str,
    incoming: &LwwRegister<T>,
) -> bool
where
    T: Clone + serde::Serialize,
{
    match table.get(key) {
        Some(current) if !incoming.supersedes(current) => false,
        _ => {
            table.insert(key.to_string(), incoming.clone());
            true
        }
    }
}

fn live_values<T: Clone>(table: &BTreeMap<AgentId, LwwRegister<T>>) -> BTreeMap<AgentId, T> {
    table
        .iter()
        .filter_map(|(id, r)| r.value.clone().map(|v| (id.clone(), v)))
        .collect()
}
