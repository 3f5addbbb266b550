pub mod nonce;
pub mod token;

pub use nonce::NonceStore;
pub use token::{CallTokenClaims, TokenVerifier};

use thiserror::Error;

/// Errors from token verification and replay protection.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Token invalid: {0}")]
    InvalidToken(String),
    #[error("Token expired")]
    Expired,
    #[error("Token call_id does not match the requested call")]
    CallMismatch,
    #[error("Nonce already used")]
    NonceReplayed,
    #[error("Auth configuration error: {0}")]
    ConfigError(String),
}

pub type AuthResult<T> = Result<T, AuthError>;
