//! Authentication
//!
//! Stateless credential verification for WebSocket upgrades and HTTP
//! requests. Supports signed bearer tokens and, behind a deployment flag,
//! identity headers set by a trusted upstream.

pub mod verifier;

pub use verifier::TokenVerifier;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The authenticated principal extracted from a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub username: Option<String>,
}

/// Authentication errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("credential is missing")]
    Missing,
    #[error("credential is malformed: {0}")]
    Malformed(String),
    #[error("credential is invalid: {0}")]
    Invalid(String),
    #[error("credential has expired")]
    Expired,
}

impl From<AuthError> for crate::error::ChatError {
    fn from(err: AuthError) -> Self {
        crate::error::ChatError::Unauthenticated(err.to_string())
    }
}
