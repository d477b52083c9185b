use chrono::{DateTime, Utc};
use serde::Serialize;

/// Registered testbed user.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    /// Sign-up email, also the user id carried in tokens.
    pub email: String,
    pub username: String,
    #[serde(skip)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}
