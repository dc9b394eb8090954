//! JWT validation for relay connections.
//!
//! Tokens are issued by the authentication service; the relay only verifies
//! them and takes the subject as the connection's user id.

use crate::error::HuddleError;
use crate::ids::UserId;
use jsonwebtoken::{DecodingKey, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};

/// JWT claims embedded in access tokens.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID as string)
    pub sub: String,
    /// Username
    pub username: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
    /// Token type ("access" or "refresh")
    pub token_type: String,
}

impl Claims {
    pub fn user_id(&self) -> UserId {
        UserId::new(self.sub.clone())
    }
}

/// Validate and decode an access token.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, HuddleError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => HuddleError::TokenExpired,
        _ => HuddleError::InvalidToken,
    })?;

    if token_data.claims.token_type != "access" {
        return Err(HuddleError::InvalidToken);
    }
    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn token(secret: &str, token_type: &str, ttl: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: "user-42".into(),
            username: "sam".into(),
            iat: now,
            exp: now + ttl,
            token_type: token_type.into(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_access_token() {
        let claims = validate_token(&token("s3cret", "access", 600), "s3cret").unwrap();
        assert_eq!(claims.user_id(), UserId::from("user-42"));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let err = validate_token(&token("s3cret", "access", 600), "other").unwrap_err();
        assert!(matches!(err, HuddleError::InvalidToken));
    }

    #[test]
    fn test_refresh_token_is_rejected() {
        let err = validate_token(&token("s3cret", "refresh", 600), "s3cret").unwrap_err();
        assert!(matches!(err, HuddleError::InvalidToken));
    }

    #[test]
    fn test_expired_token() {
        let err = validate_token(&token("s3cret", "access", -3600), "s3cret").unwrap_err();
        assert!(matches!(err, HuddleError::TokenExpired));
    }
}
