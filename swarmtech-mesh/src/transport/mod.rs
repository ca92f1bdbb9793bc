//! Direct peer transports.
//!
//! A [`Transport`] creates one [`PeerConnection`] per handshake attempt. The
//! connection negotiates through opaque strings (offer, answer, connectivity
//! candidates) that the link driver ferries over the signaling relay, and
//! reports progress on its event stream:
//!
//! ```text
//!   initiator                               responder
//!   create_offer() ──── offer ────────────▶ accept_offer() ─┐
//!        │ LocalCandidate ── candidate ───▶ add_candidate()  │
//!   apply_answer() ◀─── answer ─────────────────────────────┘
//!        │                                        │
//!        └──── ChannelOpen(PeerChannel) ──────────┘
//! ```
//!
//! Once open, a [`PeerChannel`] is ordered and reliable until either side
//! reports a terminal [`TransportState`] or its receiver yields `None`.

pub mod memory;
pub mod tcp;

use std::future::Future;

use swarmtech_core::AgentId;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// Ordered, reliable byte channel to one remote peer.
#[derive(Debug)]
pub struct PeerChannel {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

impl PeerChannel {
    /// Two channel ends wired to each other.
    pub fn pair(capacity: usize) -> (PeerChannel, PeerChannel) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (PeerChannel { tx: a_tx, rx: b_rx }, PeerChannel { tx: b_tx, rx: a_rx })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// States after which the connection never carries data again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed | TransportState::Closed)
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    /// A connectivity candidate to forward to the remote peer.
    LocalCandidate(String),
    ChannelOpen(PeerChannel),
    StateChanged(TransportState),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("malformed description: {0}")]
    MalformedDescription(String),

    /// An answer or candidate for an earlier attempt; safe to ignore.
    #[error("stale description for another handshake attempt")]
    StaleDescription,

    #[error("malformed candidate: {0}")]
    MalformedCandidate(String),

    #[error("{0} called in the wrong handshake phase")]
    WrongPhase(&'static str),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// One handshake attempt towards one remote peer.
pub trait PeerConnection: Send + 'static {
    /// Initiator: produce the local description.
    fn create_offer(&mut self) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Responder: apply the remote offer and produce an answer.
    fn accept_offer(&mut self, offer: &str) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Initiator: apply the remote answer.
    fn apply_answer(&mut self, answer: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Apply a remote connectivity candidate. Only valid once a remote
    /// description has been applied.
    fn add_candidate(&mut self, candidate: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Tear down the attempt and any channel it opened.
    fn close(&mut self);
}

/// Factory for peer connections.
pub trait Transport: Send + Sync + 'static {
    type Connection: PeerConnection;

    /// Start a handshake attempt from `local` to `remote`. Events for the
    /// attempt arrive on the returned receiver.
    fn connect(&self, local: &AgentId, remote: &AgentId) -> (Self::Connection, mpsc::Receiver<TransportEvent>);
}
