//! Last-writer-wins registers with deterministic tie-breaking.
//!
//! A register holds `Option<T>`: `None` is a tombstone. Registers are
//! ordered by `(stamp.timestamp, stamp.writer)` and, when both stamps are
//! equal, by the bincode encoding of the value. That last rule only matters
//! when one writer emits two different values in the same millisecond, but
//! without it two replicas could keep different values forever.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::AgentId;

/// Write stamp: wall-clock milliseconds plus the writing agent's id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub timestamp: u64,
    pub writer: AgentId,
}

impl Stamp {
    pub fn new(timestamp: u64, writer: impl Into<AgentId>) -> Self {
        Self { timestamp, writer: writer.into() }
    }
}

/// A single LWW cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    pub value: Option<T>,
    pub stamp: Stamp,
}

impl<T: Serialize> LwwRegister<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value: Some(value), stamp }
    }

    pub fn tombstone(stamp: Stamp) -> Self {
        Self { value: None, stamp }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Total order across replicas. `Equal` means the registers carry the
    /// same stamp and the same encoded value.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.stamp
            .cmp(&other.stamp)
            .then_with(|| value_bytes(&self.value).cmp(&value_bytes(&other.value)))
    }

    /// Whether `self` should replace `current`.
    pub fn supersedes(&self, current: &Self) -> bool {
        self.compare(current) == Ordering::Greater
    }
}

pub(crate) fn value_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    // Encoding plain data into a Vec cannot fail; an empty key still orders
    // deterministically if it ever does.
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}
