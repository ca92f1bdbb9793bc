//! Binary signaling protocol between clients and the relay.
//!
//! Frames are bincode-encoded [`SignalMessage`] values carried in WebSocket
//! binary messages:
//! ```text
//! ┌──────────┬────────────────────────────────────────────┐
//! │ variant  │ fields (room id, agent, peer ids, payload) │
//! │ varint   │ variable                                   │
//! └──────────┴────────────────────────────────────────────┘
//! ```
//!
//! Handshake payloads (`sdp`, `candidate`) are opaque strings: the relay
//! forwards them verbatim and never parses them.

use serde::{Deserialize, Serialize};
use swarmtech_core::{Agent, AgentId};

/// Kind of relayed handshake payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// Top-level signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalMessage {
    /// client → relay: register in a room.
    JoinRoom { room_id: String, agent: Agent },
    /// relay → joining client: everyone already present.
    RoomPeers { room_id: String, peers: Vec<Agent> },
    /// relay → existing members.
    PeerJoined { room_id: String, peer: Agent },
    /// relay → remaining members.
    PeerLeft { room_id: String, peer_id: AgentId },
    /// Relayed verbatim. The relay overwrites `from` with the sender's
    /// bound agent id.
    Offer { from: AgentId, to: AgentId, sdp: String },
    Answer { from: AgentId, to: AgentId, sdp: String },
    IceCandidate { from: AgentId, to: AgentId, candidate: String },
    /// client → relay: leave the current room (also implied by close).
    LeaveRoom,
    Ping,
    Pong,
}

impl SignalMessage {
    /// Build a relayed handshake message.
    pub fn relayed(kind: SignalKind, from: impl Into<AgentId>, to: impl Into<AgentId>, payload: String) -> Self {
        let (from, to) = (from.into(), to.into());
        match kind {
            SignalKind::Offer => SignalMessage::Offer { from, to, sdp: payload },
            SignalKind::Answer => SignalMessage::Answer { from, to, sdp: payload },
            SignalKind::Candidate => SignalMessage::IceCandidate { from, to, candidate: payload },
        }
    }

    /// Split a relayed handshake message into its parts.
    pub fn as_relayed(&self) -> Option<(SignalKind, &str, &str, &str)> {
        match self {
            SignalMessage::Offer { from, to, sdp } => Some((SignalKind::Offer, from.as_str(), to.as_str(), sdp.as_str())),
            SignalMessage::Answer { from, to, sdp } => Some((SignalKind::Answer, from.as_str(), to.as_str(), sdp.as_str())),
            SignalMessage::IceCandidate { from, to, candidate } => {
                Some((SignalKind::Candidate, from.as_str(), to.as_str(), candidate.as_str()))
            }
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SignalMessage::JoinRoom { .. } => "join-room",
            SignalMessage::RoomPeers { .. } => "room-peers",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::LeaveRoom => "leave-room",
            SignalMessage::Ping => "ping",
            SignalMessage::Pong => "pong",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    NotJoined,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::NotJoined => write!(f, "Not joined to a room"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmtech_core::Role;

    #[test]
    fn test_join_room_roundtrip() {
        let agent = Agent::with_id("alice", "Alice", Role::Command);
        let msg = SignalMessage::JoinRoom { room_id: "r1".into(), agent: agent.clone() };
        let decoded = SignalMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.name(), "join-room");
    }

    #[test]
    fn test_relayed_helpers() {
        for kind in [SignalKind::Offer, SignalKind::Answer, SignalKind::Candidate] {
            let msg = SignalMessage::relayed(kind, "a", "b", "payload".into());
            let (k, from, to, payload) = msg.as_relayed().unwrap();
            assert_eq!((k, from, to, payload), (kind, "a", "b", "payload"));
        }
        assert!(SignalMessage::Ping.as_relayed().is_none());
    }

    #[test]
    fn test_payload_forwarded_verbatim() {
        let sdp = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\u{1F6A8}".to_string();
        let msg = SignalMessage::relayed(SignalKind::Offer, "a", "b", sdp.clone());
        match SignalMessage::decode(&msg.encode().unwrap()).unwrap() {
            SignalMessage::Offer { sdp: got, .. } => assert_eq!(got, sdp),
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(matches!(
            SignalMessage::decode(&[0xFF, 0xFE, 0xFD]),
            Err(ProtocolError::DeserializationError(_))
        ));
        assert!(SignalMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_heartbeat_frames_are_tiny() {
        assert!(SignalMessage::Ping.encode().unwrap().len() <= 2);
        assert!(SignalMessage::LeaveRoom.encode().unwrap().len() <= 2);
    }
}
