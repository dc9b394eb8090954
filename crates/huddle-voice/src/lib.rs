//! # huddle-voice
//!
//! Client-side orchestration for Huddle calls and voice channels:
//!
//! - [`relay_client`]: WebSocket session to the signaling relay
//! - [`peer`]: one negotiated WebRTC link to one remote user
//! - [`call`]: one-to-one call lifecycle on top of a link
//! - [`mesh`]: full-mesh voice channels, one link per member
//! - [`media`]: local capture tracks shared across links
//! - [`client`]: the runtime that ties them to one relay session
//!
//! Everything below [`client::VoiceClient::run`] is synchronous and takes the
//! current time as an argument, so whole call flows can be stepped
//! deterministically in tests with [`engine::LoopbackFactory`].

pub mod call;
pub mod client;
pub mod engine;
pub mod error;
pub mod media;
pub mod mesh;
pub mod negotiation;
pub mod peer;
pub mod relay_client;
pub mod rtc;
pub mod speaking;

pub use call::{CallEvent, CallInfo, CallManager, CallRole, CallState, EndReason};
pub use client::{VoiceClient, VoiceCommand};
pub use error::{VoiceError, VoiceResult};
pub use media::{Constraints, MediaKind, MediaSourceManager, TrackHandle};
pub use mesh::{ChannelMesh, MeshEvent, Participant};
pub use peer::{LinkState, PeerLink, Role};
pub use relay_client::{RelayClient, RelayEvent, RelayHandle, RelaySession};
