//! Change subscriptions for UI consumers.
//!
//! Callbacks run synchronously on the thread that applied the change, after
//! the change is fully applied, with the freshly materialized table.

use std::collections::BTreeMap;

use crate::types::{Agent, AgentId, AgentLocation, ChatMessage};

pub type AgentsCallback = Box<dyn Fn(&BTreeMap<AgentId, Agent>) + Send + Sync>;
pub type LocationsCallback = Box<dyn Fn(&BTreeMap<AgentId, AgentLocation>) + Send + Sync>;
pub type MessagesCallback = Box<dyn Fn(&[ChatMessage]) + Send + Sync>;

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Which tables a change touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Touched {
    pub agents: bool,
    pub locations: bool,
    pub messages: bool,
}

impl Touched {
    pub fn any(&self) -> bool {
        self.agents || self.locations || self.messages
    }
}

#[derive(Default)]
pub struct Observers {
    next_id: u64,
    agents: Vec<(SubscriptionId, AgentsCallback)>,
    locations: Vec<(SubscriptionId, LocationsCallback)>,
    messages: Vec<(SubscriptionId, MessagesCallback)>,
}

impl Observers {
    fn next(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    pub fn on_agents(&mut self, callback: AgentsCallback) -> SubscriptionId {
        let id = self.next();
        self.agents.push((id, callback));
        id
    }

    pub fn on_locations(&mut self, callback: LocationsCallback) -> SubscriptionId {
        let id = self.next();
        self.locations.push((id, callback));
        id
    }

    pub fn on_messages(&mut self, callback: MessagesCallback) -> SubscriptionId {
        let id = self.next();
        self.messages.push((id, callback));
        id
    }

    /// Returns `true` if a subscription was removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.len();
        self.agents.retain(|(sid, _)| *sid != id);
        self.locations.retain(|(sid, _)| *sid != id);
        self.messages.retain(|(sid, _)| *sid != id);
        self.len() != before
    }

    pub fn len(&self) -> usize {
        self.agents.len() + self.locations.len() + self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_agents(&self) -> bool {
        !self.agents.is_empty()
    }

    pub fn has_locations(&self) -> bool {
        !self.locations.is_empty()
    }

    pub fn has_messages(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn notify_agents(&self, agents: &BTreeMap<AgentId, Agent>) {
        for (_, cb) in &self.agents {
            cb(agents);
        }
    }

    pub fn notify_locations(&self, locations: &BTreeMap<AgentId, AgentLocation>) {
        for (_, cb) in &self.locations {
            cb(locations);
        }
    }

    pub fn notify_messages(&self, messages: &[ChatMessage]) {
        for (_, cb) in &self.messages {
            cb(messages);
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("agents", &self.agents.len())
            .field("locations", &self.locations.len())
            .field("messages", &self.messages.len())
            .finish()
    }
}
