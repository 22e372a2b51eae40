//! Session Token Codec
//!
//! Stateless HS256 JWTs. Claims carry the session key (`sub`, `rid`,
//! `rty`), `iat`/`exp` in unix seconds and a random `jti`.
//!
//! Validation is purely local (signature + expiry). Whether the session
//! still exists is a separate question answered by the metadata store.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use super::key::SessionKey;

/// Minimum accepted secret length in bytes
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token secret must be at least {MIN_SECRET_LEN} bytes (got {0})")]
    SecretTooShort(usize),

    #[error("Malformed token")]
    Malformed,

    #[error("Token signature mismatch")]
    BadSignature,

    #[error("Token expired")]
    Expired,
}

/// Claims carried inside a token
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    rid: Uuid,
    rty: String,
    iat: i64,
    exp: i64,
    /// Unique id so two tokens minted in the same second still differ
    jti: Uuid,
}

/// A freshly minted token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    /// Expiry instant (unix ms)
    pub expires_at: i64,
}

impl IssuedToken {
    /// Milliseconds until expiry, measured now
    pub fn expires_in_ms(&self) -> i64 {
        (self.expires_at - Utc::now().timestamp_millis()).max(0)
    }
}

/// Issues and validates signed session tokens with a process-wide secret
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Result<Self, TokenError> {
        let secret = secret.as_ref();
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::SecretTooShort(secret.len()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        })
    }

    /// Token lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a token for `key`, expiring `ttl` from now
    pub fn issue(&self, key: &SessionKey) -> IssuedToken {
        let now = Utc::now().timestamp();
        let exp = now.saturating_add(self.ttl.as_secs() as i64);
        let claims = Claims {
            sub: key.user_id,
            rid: key.resource_id,
            rty: key.resource_type.clone(),
            iat: now,
            exp,
            jti: Uuid::new_v4(),
        };

        // HS256 with a plain struct of claims does not fail
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .unwrap_or_else(|e| {
                error!("Failed to sign session token: {}", e);
                String::new()
            });

        IssuedToken {
            token,
            expires_at: exp.saturating_mul(1000),
        }
    }

    /// Validate a token, failing closed
    pub fn validate(&self, token: &str) -> Option<SessionKey> {
        match self.decode(token) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!("Rejected token {}: {}", token_hint(token), e);
                None
            }
        }
    }

    /// Validate and report the reason for rejection
    pub fn decode(&self, token: &str) -> Result<SessionKey, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                _ => TokenError::Malformed,
            }
        })?;
        let claims = data.claims;
        Ok(SessionKey::new(claims.sub, claims.rid, claims.rty))
    }
}

/// Short, non-secret prefix of a token for log lines
pub fn token_hint(token: &str) -> String {
    let tail = token.rsplit('.').next().unwrap_or(token);
    let hint: String = tail.chars().take(8).collect();
    format!("…{}", hint)
}
