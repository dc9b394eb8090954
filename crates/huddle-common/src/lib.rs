//! # huddle-common
//!
//! Shared identifiers, the signaling wire schema, configuration, and error
//! handling used by both the relay and the client orchestration crates.
//! No business logic lives here, only primitives and contracts.

pub mod auth;
pub mod config;
pub mod error;
pub mod ids;
pub mod signal;

pub use error::{HuddleError, HuddleResult};
pub use ids::{CallId, ChannelId, ConnectionId, TrackId, UserId};
pub use signal::{CallType, CandidatePayload, Scope, Signal, SignalKind, VoiceFlags};
