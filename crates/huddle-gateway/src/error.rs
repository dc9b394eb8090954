//! Relay error types.

use huddle_common::{ChannelId, ConnectionId, HuddleError, SignalKind, UserId};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Connection already identified")]
    AlreadyIdentified,

    #[error("Signal claims sender {claimed} but connection belongs to {actual}")]
    SenderMismatch { claimed: UserId, actual: UserId },

    #[error("{to} has no live connection")]
    DeliveryFailed { to: UserId },

    #[error("Not in voice channel {0}")]
    NotInChannel(ChannelId),

    #[error("Signal {0} cannot be sent by a client")]
    InvalidSignal(SignalKind),

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error(transparent)]
    Common(#[from] HuddleError),
}

impl RelayError {
    /// Numeric code sent to clients in `error` frames.
    pub fn code(&self) -> u32 {
        match self {
            Self::NotAuthenticated => 4003,
            Self::AlreadyIdentified => 4006,
            Self::SenderMismatch { .. } => 4005,
            Self::DeliveryFailed { .. } => 4040,
            Self::NotInChannel(_) => 4007,
            Self::InvalidSignal(_) => 4000,
            Self::UnknownConnection(_) => 4009,
            Self::Common(e) => e.code(),
        }
    }
}
