//! Authentication errors.

use thiserror::Error;

/// Errors returned by token verification.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token has expired")]
    TokenExpired,

    #[error("token does not match the claimed user id")]
    IdentityMismatch,

    #[error("authentication error: {0}")]
    Internal(String),
}
