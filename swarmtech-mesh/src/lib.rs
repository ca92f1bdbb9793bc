//! # swarmtech-mesh — peer discovery and direct links for field teams
//!
//! A small relay introduces peers; every pair of peers in a room then holds
//! one direct link that carries document frames.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket (signaling)   ┌──────────────┐
//! │ SwarmSession │ ◄───────────────────────► │ RelayServer  │
//! │  (device A)  │                           │ RoomRegistry │
//! └──────┬───────┘                           └──────▲───────┘
//!        │ direct link (Transport)                  │
//!        ▼                                          │
//! ┌──────────────┐   WebSocket (signaling)          │
//! │ SwarmSession │ ◄────────────────────────────────┘
//! │  (device B)  │
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — signaling messages (bincode)
//! - [`registry`] — in-memory rooms with per-session bindings
//! - [`relay`] — axum WebSocket relay plus `/health` and `/rooms/:id`
//! - [`signaling`] — relay client
//! - [`transport`] — `Transport` seam, TCP and in-memory implementations
//! - [`link`] — per-peer handshake state machine
//! - [`manager`] — one link per peer, initiated only by the newcomer
//! - [`propagator`] — fan-out to open links
//! - [`session`] — ties the replicated document to the mesh
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | One link per pair | only the joining peer initiates |
//! | Late joiners converge | snapshot on every link open |
//! | Bounded duplicates | rebroadcast skips the origin link; O(n) per delta |
//! | No stuck handshakes | timeout, one initiator retry |
//! | No silent drops on a live link | per-route writer task awaits the link channel |

pub mod config;
pub mod error;
pub mod link;
pub mod manager;
pub mod propagator;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{MeshConfig, RelayConfig, TcpTransportConfig};
pub use error::MeshError;
pub use link::{LinkRole, LinkState};
pub use manager::LinkInfo;
pub use propagator::{Propagator, PropagatorStats};
pub use protocol::{ProtocolError, SignalKind, SignalMessage};
pub use registry::{RoomInfo, RoomRegistry, SessionHandle};
pub use relay::{RelayServer, RelayState, RelayStats};
pub use session::{SessionEvent, SwarmSession};
pub use signaling::{ConnectionState, SignalClient, SignalEvent, SignalSender};
pub use transport::{
    MemoryNetwork, MemoryTransport, PeerChannel, PeerConnection, TcpTransport, Transport,
    TransportError, TransportEvent, TransportState,
};
