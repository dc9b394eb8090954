//! Signaling wire schema, shared by the relay and its clients.
//!
//! Every frame on the relay connection is one JSON-encoded [`Signal`], tagged
//! by `type`. The relay only looks at the addressing fields (`from_id`,
//! `to_id`, `scope`, `channel_id`); SDP and candidate payloads pass through
//! untouched.

use crate::ids::{CallId, ChannelId, ConnectionId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Media requested by a one-to-one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Voice,
    Video,
}

/// What a negotiation message belongs to: a one-to-one call or one edge of a
/// channel mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Call(CallId),
    Channel(ChannelId),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Call(id) => write!(f, "call:{id}"),
            Scope::Channel(id) => write!(f, "channel:{id}"),
        }
    }
}

/// A connectivity candidate announcement, opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

impl CandidatePayload {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Local participant state fanned out to a call peer or a whole channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceFlags {
    pub self_mute: bool,
    pub self_deaf: bool,
    pub speaking: bool,
    pub video: bool,
    pub screen_share: bool,
}

/// STUN/TURN server handed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Public STUN servers used when nothing is configured.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                urls: vec![
                    "stun:stun.l.google.com:19302".into(),
                    "stun:stun1.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            },
            Self {
                urls: vec!["stun:stun.cloudflare.com:3478".into()],
                username: None,
                credential: None,
            },
        ]
    }
}

/// One frame on the relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Signal {
    // === Session ===
    /// Client → Relay: authenticate the connection.
    #[serde(rename = "identify")]
    Identify { token: String },

    /// Relay → Client: connection registered.
    #[serde(rename = "ready")]
    Ready {
        user_id: UserId,
        connection_id: ConnectionId,
        heartbeat_interval_ms: u64,
        ice_servers: Vec<IceServer>,
    },

    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: i64 },

    #[serde(rename = "heartbeat:ack")]
    HeartbeatAck { timestamp: i64 },

    /// Relay → Client: protocol error.
    #[serde(rename = "error")]
    Error { code: u32, message: String },

    // === Presence ===
    #[serde(rename = "presence:online")]
    PresenceOnline { user_id: UserId },

    #[serde(rename = "presence:offline")]
    PresenceOffline { user_id: UserId },

    // === Call control ===
    #[serde(rename = "call:invite")]
    CallInvite {
        from_id: UserId,
        to_id: UserId,
        call_id: CallId,
        call_type: CallType,
    },

    #[serde(rename = "call:accept")]
    CallAccept {
        from_id: UserId,
        to_id: UserId,
        call_id: CallId,
    },

    #[serde(rename = "call:reject")]
    CallReject {
        from_id: UserId,
        to_id: UserId,
        call_id: CallId,
    },

    #[serde(rename = "call:end")]
    CallEnd {
        from_id: UserId,
        to_id: UserId,
        call_id: CallId,
    },

    // === Negotiation ===
    #[serde(rename = "nego:offer")]
    NegoOffer {
        from_id: UserId,
        to_id: UserId,
        scope: Scope,
        revision: u32,
        sdp: String,
    },

    #[serde(rename = "nego:answer")]
    NegoAnswer {
        from_id: UserId,
        to_id: UserId,
        scope: Scope,
        revision: u32,
        sdp: String,
    },

    #[serde(rename = "nego:candidate")]
    NegoCandidate {
        from_id: UserId,
        to_id: UserId,
        scope: Scope,
        candidate: CandidatePayload,
    },

    // === Voice channels ===
    #[serde(rename = "channel:join")]
    ChannelJoin { user_id: UserId, channel_id: ChannelId },

    #[serde(rename = "channel:leave")]
    ChannelLeave { user_id: UserId, channel_id: ChannelId },

    /// Relay → Joiner: everyone already in the channel.
    #[serde(rename = "channel:members")]
    ChannelMembers {
        channel_id: ChannelId,
        members: Vec<UserId>,
    },

    #[serde(rename = "member:joined")]
    MemberJoined { channel_id: ChannelId, user_id: UserId },

    #[serde(rename = "member:left")]
    MemberLeft { channel_id: ChannelId, user_id: UserId },

    /// Mute/deafen/speaking/video/screen-share state. Without `to_id` it is
    /// fanned out to every other member of the channel in `scope`.
    #[serde(rename = "voice:state")]
    VoiceState {
        from_id: UserId,
        scope: Scope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_id: Option<UserId>,
        flags: VoiceFlags,
    },

    /// Relay → Sender: the addressed user has no live connection.
    #[serde(rename = "delivery:failed")]
    DeliveryFailed {
        to_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        kind: SignalKind,
    },
}

/// Where the relay must deliver a client-originated signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient<'a> {
    User(&'a UserId),
    /// Every member of the channel except the sender.
    Channel(&'a ChannelId),
    /// Handled by the relay itself (session, membership).
    Relay,
    /// Relay-originated; never accepted from a client.
    None,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Identify { .. } => SignalKind::Identify,
            Signal::Ready { .. } => SignalKind::Ready,
            Signal::Heartbeat { .. } => SignalKind::Heartbeat,
            Signal::HeartbeatAck { .. } => SignalKind::HeartbeatAck,
            Signal::Error { .. } => SignalKind::Error,
            Signal::PresenceOnline { .. } => SignalKind::PresenceOnline,
            Signal::PresenceOffline { .. } => SignalKind::PresenceOffline,
            Signal::CallInvite { .. } => SignalKind::CallInvite,
            Signal::CallAccept { .. } => SignalKind::CallAccept,
            Signal::CallReject { .. } => SignalKind::CallReject,
            Signal::CallEnd { .. } => SignalKind::CallEnd,
            Signal::NegoOffer { .. } => SignalKind::NegoOffer,
            Signal::NegoAnswer { .. } => SignalKind::NegoAnswer,
            Signal::NegoCandidate { .. } => SignalKind::NegoCandidate,
            Signal::ChannelJoin { .. } => SignalKind::ChannelJoin,
            Signal::ChannelLeave { .. } => SignalKind::ChannelLeave,
            Signal::ChannelMembers { .. } => SignalKind::ChannelMembers,
            Signal::MemberJoined { .. } => SignalKind::MemberJoined,
            Signal::MemberLeft { .. } => SignalKind::MemberLeft,
            Signal::VoiceState { .. } => SignalKind::VoiceState,
            Signal::DeliveryFailed { .. } => SignalKind::DeliveryFailed,
        }
    }

    /// The user a client claims to be sending as.
    pub fn sender(&self) -> Option<&UserId> {
        match self {
            Signal::CallInvite { from_id, .. }
            | Signal::CallAccept { from_id, .. }
            | Signal::CallReject { from_id, .. }
            | Signal::CallEnd { from_id, .. }
            | Signal::NegoOffer { from_id, .. }
            | Signal::NegoAnswer { from_id, .. }
            | Signal::NegoCandidate { from_id, .. }
            | Signal::VoiceState { from_id, .. } => Some(from_id),
            Signal::ChannelJoin { user_id, .. } | Signal::ChannelLeave { user_id, .. } => {
                Some(user_id)
            }
            _ => None,
        }
    }

    pub fn recipient(&self) -> Recipient<'_> {
        match self {
            Signal::CallInvite { to_id, .. }
            | Signal::CallAccept { to_id, .. }
            | Signal::CallReject { to_id, .. }
            | Signal::CallEnd { to_id, .. }
            | Signal::NegoOffer { to_id, .. }
            | Signal::NegoAnswer { to_id, .. }
            | Signal::NegoCandidate { to_id, .. } => Recipient::User(to_id),
            Signal::VoiceState {
                to_id: Some(to_id), ..
            } => Recipient::User(to_id),
            Signal::VoiceState {
                to_id: None,
                scope: Scope::Channel(channel_id),
                ..
            } => Recipient::Channel(channel_id),
            Signal::VoiceState {
                to_id: None,
                scope: Scope::Call(_),
                ..
            } => Recipient::None,
            Signal::Identify { .. }
            | Signal::Heartbeat { .. }
            | Signal::ChannelJoin { .. }
            | Signal::ChannelLeave { .. } => Recipient::Relay,
            Signal::Ready { .. }
            | Signal::HeartbeatAck { .. }
            | Signal::Error { .. }
            | Signal::PresenceOnline { .. }
            | Signal::PresenceOffline { .. }
            | Signal::ChannelMembers { .. }
            | Signal::MemberJoined { .. }
            | Signal::MemberLeft { .. }
            | Signal::DeliveryFailed { .. } => Recipient::None,
        }
    }

    /// Call the signal belongs to, if any.
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Signal::CallInvite { call_id, .. }
            | Signal::CallAccept { call_id, .. }
            | Signal::CallReject { call_id, .. }
            | Signal::CallEnd { call_id, .. } => Some(*call_id),
            Signal::NegoOffer { scope, .. }
            | Signal::NegoAnswer { scope, .. }
            | Signal::NegoCandidate { scope, .. }
            | Signal::VoiceState { scope, .. } => match scope {
                Scope::Call(id) => Some(*id),
                Scope::Channel(_) => None,
            },
            Signal::DeliveryFailed { call_id, .. } => *call_id,
            _ => None,
        }
    }
}

/// Wire name of each signal, used in logs and delivery failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    #[serde(rename = "identify")]
    Identify,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "heartbeat:ack")]
    HeartbeatAck,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "presence:online")]
    PresenceOnline,
    #[serde(rename = "presence:offline")]
    PresenceOffline,
    #[serde(rename = "call:invite")]
    CallInvite,
    #[serde(rename = "call:accept")]
    CallAccept,
    #[serde(rename = "call:reject")]
    CallReject,
    #[serde(rename = "call:end")]
    CallEnd,
    #[serde(rename = "nego:offer")]
    NegoOffer,
    #[serde(rename = "nego:answer")]
    NegoAnswer,
    #[serde(rename = "nego:candidate")]
    NegoCandidate,
    #[serde(rename = "channel:join")]
    ChannelJoin,
    #[serde(rename = "channel:leave")]
    ChannelLeave,
    #[serde(rename = "channel:members")]
    ChannelMembers,
    #[serde(rename = "member:joined")]
    MemberJoined,
    #[serde(rename = "member:left")]
    MemberLeft,
    #[serde(rename = "voice:state")]
    VoiceState,
    #[serde(rename = "delivery:failed")]
    DeliveryFailed,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Identify => "identify",
            SignalKind::Ready => "ready",
            SignalKind::Heartbeat => "heartbeat",
            SignalKind::HeartbeatAck => "heartbeat:ack",
            SignalKind::Error => "error",
            SignalKind::PresenceOnline => "presence:online",
            SignalKind::PresenceOffline => "presence:offline",
            SignalKind::CallInvite => "call:invite",
            SignalKind::CallAccept => "call:accept",
            SignalKind::CallReject => "call:reject",
            SignalKind::CallEnd => "call:end",
            SignalKind::NegoOffer => "nego:offer",
            SignalKind::NegoAnswer => "nego:answer",
            SignalKind::NegoCandidate => "nego:candidate",
            SignalKind::ChannelJoin => "channel:join",
            SignalKind::ChannelLeave => "channel:leave",
            SignalKind::ChannelMembers => "channel:members",
            SignalKind::MemberJoined => "member:joined",
            SignalKind::MemberLeft => "member:left",
            SignalKind::VoiceState => "voice:state",
            SignalKind::DeliveryFailed => "delivery:failed",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
