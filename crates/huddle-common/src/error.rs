//! Shared error type for Huddle crates.
//!
//! Uses `thiserror` for ergonomic definitions. Each service crate layers its own
//! domain error on top and converts from this one with `#[from]`.

/// Core error type used across Huddle crates.
#[derive(Debug, thiserror::Error)]
pub enum HuddleError {
    // === Auth errors ===
    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    // === Protocol errors ===
    #[error("Malformed signal: {0}")]
    Malformed(#[from] serde_json::Error),

    // === Infrastructure errors ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl HuddleError {
    /// Numeric code sent to clients in `error` frames.
    pub fn code(&self) -> u32 {
        match self {
            Self::TokenExpired | Self::InvalidToken => 4004,
            Self::Malformed(_) => 4000,
            Self::Config(_) => 5000,
        }
    }
}

/// Convenience type alias for Results using HuddleError.
pub type HuddleResult<T> = Result<T, HuddleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_split_client_and_server_faults() {
        assert_eq!(HuddleError::InvalidToken.code(), 4004);
        let malformed = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(HuddleError::from(malformed).code(), 4000);
        let config = config::ConfigError::Message("missing".into());
        assert_eq!(HuddleError::from(config).code(), 5000);
    }
}
