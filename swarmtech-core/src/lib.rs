//! # swarmtech-core — shared state for field teams
//!
//! Data model and replicated document for a room of peers that exchange
//! state directly with each other.
//!
//! ## Modules
//!
//! - [`types`] — Agent, Role, AgentLocation, ChatMessage
//! - [`document`] — CRDT tables (LWW roster and locations, causal message
//!   log), merge, wire format, and change observers
//! - [`utils`] — clocks, id validation, input sanitizing
//!
//! ## Guarantees
//!
//! | Property | Holds for |
//! |----------|-----------|
//! | Idempotence | `merge(merge(d, x), x) == merge(d, x)` |
//! | Commutativity | any order of independent frames |
//! | Convergence | same frame set, with duplicates, in any order |
//! | Atomicity | malformed frames never partially apply |

pub mod document;
pub mod error;
pub mod types;
pub mod utils;

pub use document::{
    DocumentView, Entry, Frame, FrameKind, LogEntry, LwwRegister, MergeOutcome,
    ReplicatedDocument, Stamp, SubscriptionId,
};
pub use error::DocumentError;
pub use types::{Agent, AgentId, AgentLocation, ChatMessage, LocationOptions, MessageKind, Role};
pub use utils::{is_valid_room_id, now_millis, sanitize_input};
