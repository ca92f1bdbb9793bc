//! Wire format for document deltas and snapshots.
//!
//! ```text
//! ┌─────────┬─────────┬──────────────────────────────────────┐
//! │ version │ flags   │ body: bincode(Frame), LZ4 if flag=1  │
//! │ 1 byte  │ 1 byte  │ variable                             │
//! └─────────┴─────────┴──────────────────────────────────────┘
//! ```
//!
//! Bodies over [`COMPRESS_THRESHOLD`] bytes are LZ4 block-compressed with
//! the uncompressed size prepended. Snapshots of a busy room compress well
//! because agent and message records repeat the same ids and names.

use serde::{Deserialize, Serialize};

use crate::document::log::LogEntry;
use crate::document::lww::LwwRegister;
use crate::error::DocumentError;
use crate::types::{Agent, AgentId, AgentLocation};

pub const FRAME_VERSION: u8 = 1;
pub const COMPRESS_THRESHOLD: usize = 1024;

const FLAG_RAW: u8 = 0;
const FLAG_LZ4: u8 = 1;

/// One replicated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entry {
    Agent { agent_id: AgentId, register: LwwRegister<Agent> },
    Location { agent_id: AgentId, register: LwwRegister<AgentLocation> },
    Message(LogEntry),
}

impl Entry {
    /// Reject entries whose key disagrees with their payload.
    pub fn validate(&self) -> Result<(), DocumentError> {
        match self {
            Entry::Agent { agent_id, register } => {
                if agent_id.is_empty() {
                    return Err(DocumentError::InvalidEntry("empty agent id".into()));
                }
                if let Some(agent) = &register.value {
                    if &agent.id != agent_id {
                        return Err(DocumentError::InvalidEntry(format!(
                            "agent record {} stored under key {agent_id}",
                            agent.id
                        )));
                    }
                }
            }
            Entry::Location { agent_id, register } => {
                if agent_id.is_empty() {
                    return Err(DocumentError::InvalidEntry("empty agent id".into()));
                }
                if let Some(location) = &register.value {
                    if &location.agent_id != agent_id {
                        return Err(DocumentError::InvalidEntry(format!(
                            "location for {} stored under key {agent_id}",
                            location.agent_id
                        )));
                    }
                }
            }
            Entry::Message(entry) => {
                if entry.message.id.is_empty() {
                    return Err(DocumentError::InvalidEntry("empty message id".into()));
                }
                if entry.seq == 0 {
                    return Err(DocumentError::InvalidEntry(format!(
                        "message {} has sequence 0",
                        entry.message.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// Incremental change(s).
    Delta,
    /// Full state, sent when a link opens.
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub entries: Vec<Entry>,
}

impl Frame {
    pub fn delta(entries: Vec<Entry>) -> Self {
        Self { kind: FrameKind::Delta, entries }
    }

    pub fn snapshot(entries: Vec<Entry>) -> Self {
        Self { kind: FrameKind::Snapshot, entries }
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Result<Vec<u8>, DocumentError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| DocumentError::Serialization(e.to_string()))?;

        let (flag, body) = if body.len() > COMPRESS_THRESHOLD {
            (FLAG_LZ4, lz4_flex::compress_prepend_size(&body))
        } else {
            (FLAG_RAW, body)
        };

        let mut out = Vec::with_capacity(body.len() + 2);
        out.push(FRAME_VERSION);
        out.push(flag);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Deserialize and validate. Never partially succeeds.
    pub fn decode(bytes: &[u8]) -> Result<Self, DocumentError> {
        let [version, flag, body @ ..] = bytes else {
            return Err(DocumentError::Malformed(format!("frame too short ({} bytes)", bytes.len())));
        };
        if *version != FRAME_VERSION {
            return Err(DocumentError::UnsupportedVersion(*version));
        }

        let decompressed;
        let body = match *flag {
            FLAG_RAW => body,
            FLAG_LZ4 => {
                decompressed = lz4_flex::decompress_size_prepended(body)
                    .map_err(|e| DocumentError::Decompression(e.to_string()))?;
                decompressed.as_slice()
            }
            other => return Err(DocumentError::Malformed(format!("unknown flags {other:#04x}"))),
        };

        let (frame, read): (Frame, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())
                .map_err(|e| DocumentError::Malformed(e.to_string()))?;
        if read != body.len() {
            return Err(DocumentError::Malformed(format!(
                "{} trailing bytes after frame",
                body.len() - read
            )));
        }

        for entry in &frame.entries {
            entry.validate()?;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::lww::Stamp;
    use crate::types::{ChatMessage, MessageKind, Role};

    fn agent_entry(id: &str) -> Entry {
        Entry::Agent {
            agent_id: id.into(),
            register: LwwRegister::new(Agent::with_id(id, "Alice", Role::Field), Stamp::new(1, id)),
        }
    }

    fn message_entry(i: usize) -> Entry {
        Entry::Message(LogEntry {
            seq: i as u64 + 1,
            message: ChatMessage {
                id: format!("msg-{i}"),
                agent_id: "alice".into(),
                agent_name: "Alice".into(),
                content: "status report: sector clear, moving to next checkpoint".into(),
                timestamp: 1_700_000_000_000,
                kind: MessageKind::Text,
            },
        })
    }

    #[test]
    fn test_small_frame_stays_raw() {
        let bytes = Frame::delta(vec![agent_entry("a")]).encode().unwrap();
        assert_eq!(bytes[0], FRAME_VERSION);
        assert_eq!(bytes[1], FLAG_RAW);
    }

    #[test]
    fn test_large_snapshot_is_compressed() {
        let entries: Vec<_> = (0..50).map(message_entry).collect();
        let frame = Frame::snapshot(entries);
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[1], FLAG_LZ4);

        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_rejects_truncated_and_garbage() {
        assert!(matches!(Frame::decode(&[]), Err(DocumentError::Malformed(_))));
        assert!(matches!(Frame::decode(&[9, 0, 1]), Err(DocumentError::UnsupportedVersion(9))));
        assert!(Frame::decode(&[FRAME_VERSION, FLAG_RAW, 0xFF, 0xFE, 0xFD]).is_err());
        assert!(matches!(
            Frame::decode(&[FRAME_VERSION, FLAG_LZ4, 0xFF]),
            Err(DocumentError::Decompression(_))
        ));
        assert!(Frame::decode(&[FRAME_VERSION, 7]).is_err());
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = Frame::delta(vec![agent_entry("a")]).encode().unwrap();
        bytes.push(0);
        assert!(matches!(Frame::decode(&bytes), Err(DocumentError::Malformed(_))));
    }

    #[test]
    fn test_rejects_mismatched_key() {
        let entry = Entry::Agent {
            agent_id: "mallory".into(),
            register: LwwRegister::new(Agent::with_id("alice", "Alice", Role::Field), Stamp::new(1, "x")),
        };
        let bytes = Frame::delta(vec![agent_entry("ok"), entry]).encode().unwrap();
        assert!(matches!(Frame::decode(&bytes), Err(DocumentError::InvalidEntry(_))));
    }
}
