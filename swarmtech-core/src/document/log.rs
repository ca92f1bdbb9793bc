//! Append-only message log ordered by `(seq, author, id)`.
//!
//! Sequence numbers are Lamport clocks: an author appends with
//! `max(seq seen) + 1`, so a message always sorts after everything its
//! author had already received. Merge is a keyed union on message id.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::document::lww::value_bytes;
use crate::types::{AgentId, ChatMessage};

/// A message together with its causal sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub message: ChatMessage,
}

impl LogEntry {
    pub fn author(&self) -> &AgentId {
        &self.message.agent_id
    }

    fn order_key(&self) -> OrderKey {
        (self.seq, self.message.agent_id.clone(), self.message.id.clone())
    }

    /// Tie-break between two entries claiming the same message id.
    fn outranks(&self, other: &LogEntry) -> bool {
        (self.seq, self.author())
            .cmp(&(other.seq, other.author()))
            .then_with(|| value_bytes(&self.message).cmp(&value_bytes(&other.message)))
            .is_gt()
    }
}

type OrderKey = (u64, AgentId, String);

#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    ordered: BTreeMap<OrderKey, LogEntry>,
    by_id: HashMap<String, OrderKey>,
    max_seq: u64,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number for the next locally authored message.
    pub fn next_seq(&self) -> u64 {
        self.max_seq + 1
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Insert or replace. Returns `true` when the log changed.
    pub fn merge(&mut self, entry: LogEntry) -> bool {
        if let Some(key) = self.by_id.get(&entry.message.id) {
            let current = &self.ordered[key];
            if !entry.outranks(current) {
                return false;
            }
            let stale = key.clone();
            self.ordered.remove(&stale);
        }

        self.max_seq = self.max_seq.max(entry.seq);
        let key = entry.order_key();
        self.by_id.insert(entry.message.id.clone(), key.clone());
        self.ordered.insert(key, entry);
        true
    }

    /// Entries in log order.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.ordered.values()
    }

    /// Messages in log order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.ordered.values().map(|e| e.message.clone()).collect()
    }
}
