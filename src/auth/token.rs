use std::fs;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::nonce::NonceStore;
use super::{AuthError, AuthResult};
use crate::config::ServerConfig;

/// Claims carried by a call access token.
///
/// `nonce` is single-use: replaying a token within its lifetime fails even
/// though the signature is still valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTokenClaims {
    /// Subject (caller identity at the issuing control plane).
    pub sub: String,
    /// Call this token grants access to.
    pub call_id: String,
    /// Issued at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// One-shot replay guard.
    pub nonce: String,
}

impl CallTokenClaims {
    /// Remaining lifetime from now; zero when already expired.
    pub fn remaining_lifetime(&self) -> Duration {
        let now = unix_now();
        Duration::from_secs((self.exp - now).max(0) as u64)
    }
}

/// Verifies bearer tokens with either a shared secret (HS256) or a public
/// key in PEM form (RS256).
pub struct TokenVerifier {
    key: DecodingKey,
    algorithm: Algorithm,
}

impl TokenVerifier {
    pub fn hs256(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm: Algorithm::HS256,
        }
    }

    pub fn rs256_pem(pem: &[u8]) -> AuthResult<Self> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| AuthError::ConfigError(format!("invalid RSA public key: {e}")))?;
        Ok(Self {
            key,
            algorithm: Algorithm::RS256,
        })
    }

    /// Build a verifier from the server configuration; `None` when no auth
    /// method is configured (and auth is not required).
    pub fn from_config(config: &ServerConfig) -> AuthResult<Option<Self>> {
        if let Some(path) = &config.auth_public_key_path {
            let pem = fs::read(path).map_err(|e| {
                AuthError::ConfigError(format!("cannot read {}: {e}", path.display()))
            })?;
            return Self::rs256_pem(&pem).map(Some);
        }
        if let Some(secret) = &config.auth_secret {
            return Ok(Some(Self::hs256(secret)));
        }
        Ok(None)
    }

    /// Verify signature and expiry, returning the decoded claims.
    pub fn verify(&self, token: &str) -> AuthResult<CallTokenClaims> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        validation.leeway = 5;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<CallTokenClaims>(token, &self.key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        Ok(data.claims)
    }

    /// Full admission check for one connection: signature, expiry, call-id
    /// binding and one-shot nonce registration.
    pub fn authorize(
        &self,
        token: &str,
        expected_call_id: &str,
        nonces: &NonceStore,
    ) -> AuthResult<CallTokenClaims> {
        let claims = self.verify(token)?;
        if claims.call_id != expected_call_id {
            return Err(AuthError::CallMismatch);
        }
        if claims.nonce.is_empty() {
            return Err(AuthError::InvalidToken("empty nonce".to_string()));
        }
        // TTL equals the remaining token lifetime: after expiry the token
        // itself is rejected, so the nonce needs no longer memory
        if !nonces.register(&claims.nonce, claims.remaining_lifetime()) {
            return Err(AuthError::NonceReplayed);
        }
        Ok(claims)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
