//! Token verification.
//!
//! Connections authenticate in-protocol by presenting a JWT inside an
//! `InitData` envelope; there is no per-request HTTP middleware. Supports:
//! - HS256 JWT validation against a configured secret
//! - an explicit, logged system bypass token for operational use

mod claims;
mod config;
mod error;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use tracing::warn;

pub use claims::Claims;
pub use config::{AuthConfig, ConfigValidationError};
pub use error::AuthError;

/// Identity assigned to connections authenticated via the system bypass token.
pub const SYSTEM_USER_ID: &str = "system";

/// Verifies tokens and mints them for operational tooling and tests.
#[derive(Clone)]
pub struct AuthState {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    system_token: Option<String>,
}

impl AuthState {
    /// Build the auth state from a validated configuration.
    pub fn new(config: AuthConfig) -> Result<Self, ConfigValidationError> {
        config.validate()?;
        let secret = config
            .resolve_jwt_secret()?
            .ok_or(ConfigValidationError::MissingJwtSecret)?;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            system_token: config.system_token,
        })
    }

    /// Verify a token and return the identity it belongs to.
    ///
    /// The system bypass token is checked first and kept out of the JWT
    /// path entirely so every use of it is visible in the logs.
    pub fn verify_token(&self, token: &str) -> Result<String, AuthError> {
        if let Some(ref system_token) = self.system_token {
            if token == system_token {
                warn!("system bypass token used for authentication");
                return Ok(SYSTEM_USER_ID.to_string());
            }
        }

        let validation = Validation::new(Algorithm::HS256);
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(err.to_string()),
            })?;

        Ok(data.claims.sub)
    }

    /// Mint a token for the given user, valid for `ttl_secs` seconds.
    pub fn encode_token(&self, user_id: &str, ttl_secs: i64) -> Result<String, AuthError> {
        let claims = Claims::new(user_id, ttl_secs);
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| AuthError::Internal(err.to_string()))
    }
}
