use swarmtech_core::DocumentError;
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Errors surfaced by [`crate::SwarmSession`] and the signaling client.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error("signaling protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to reach relay at {url}: {reason}")]
    RelayUnreachable { url: String, reason: String },

    #[error("invalid room id {0:?}")]
    InvalidRoomId(String),

    #[error("session already connected to room {0}")]
    AlreadyConnected(String),

    #[error("session is shut down")]
    Shutdown,
}
