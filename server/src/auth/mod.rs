//! Password hashing and bearer tokens for testbed users.

mod password;
mod token;

pub use password::{hash_password, verify_password};
pub use token::TokenIssuer;

/// Authenticated user extracted from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// User id (the sign-up email).
    pub sub: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Token encoding failed: {0}")]
    Encoding(String),
    #[error("Password hashing failed: {0}")]
    Hashing(String),
}
