//! Client-side error taxonomy.

use crate::media::MediaKind;
use huddle_common::{HuddleError, UserId};

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    // === Call and link failures ===
    #[error("{kind} device unavailable: {reason}")]
    DeviceUnavailable { kind: MediaKind, reason: String },

    #[error("Signal to {0} could not be delivered")]
    DeliveryFailed(UserId),

    #[error("Negotiation with {0} timed out")]
    NegotiationTimeout(UserId),

    #[error("Connectivity to {0} lost")]
    ConnectivityLost(UserId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // === Transport ===
    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Relay rejected the connection ({code}): {message}")]
    Rejected { code: u32, message: String },

    #[error("Relay connection closed")]
    RelayClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] HuddleError),
}

pub type VoiceResult<T> = Result<T, VoiceError>;
