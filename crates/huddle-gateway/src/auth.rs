//! Connection authentication.
//!
//! Token issuance belongs to the authentication service. The relay trusts
//! whatever user id an [`Authenticator`] returns and never re-verifies it.

use huddle_common::{HuddleError, UserId, auth::validate_token};

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<UserId, HuddleError>;
}

/// HS256 access tokens signed with a shared secret.
pub struct JwtAuthenticator {
    secret: String,
}

impl JwtAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> Result<UserId, HuddleError> {
        let claims = validate_token(token, &self.secret)?;
        tracing::debug!(user = %claims.sub, username = %claims.username, "Token accepted");
        Ok(claims.user_id())
    }
}
