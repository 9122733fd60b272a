//! Session Token Codec
//!
//! Issues and verifies HS256 session tokens. Unlike the login flow, the codec
//! knows nothing about users: it signs a subject and gives the subject back.
//!
//! Verification distinguishes three failure reasons so that logs can tell
//! them apart, but callers facing the network must collapse them into one
//! generic response.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::TokenConfig;

/// Minimum signing key length in bytes.
pub const MIN_KEY_LEN: usize = 32;

/// The only token type this codec issues or accepts.
pub const ACCESS_TOKEN_TYPE: &str = "access";

/// Claims carried by every session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject: the login id of the user.
    pub sub: String,
    /// Issued at (Unix seconds).
    pub iat: i64,
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Issuer tag.
    pub iss: String,
    /// Token type. Always [`ACCESS_TOKEN_TYPE`].
    pub typ: String,
}

/// Verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Not a token, wrong issuer or type, or missing claims.
    #[error("malformed token")]
    Malformed,
    /// Signature does not match the key.
    #[error("invalid token signature")]
    InvalidSignature,
    /// Expiry has passed.
    #[error("token expired")]
    Expired,
    /// Signing failed while issuing.
    #[error("token signing failed: {0}")]
    Signing(String),
}

/// Startup misconfiguration of the codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenConfigError {
    /// Signing key is too short to be safe.
    #[error("token signing key is {len} bytes, at least {min} required")]
    KeyTooShort {
        /// Actual length.
        len: usize,
        /// Required minimum.
        min: usize,
    },
    /// Lifetime does not fit a calendar duration.
    #[error("token lifetime of {secs}s is out of range")]
    TtlOutOfRange {
        /// Configured lifetime.
        secs: u64,
    },
}

/// A freshly issued token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Compact JWT.
    pub token: String,
    /// When it stops verifying.
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies session tokens.
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl: ChronoDuration,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Build a codec. Fails if the secret is shorter than [`MIN_KEY_LEN`].
    pub fn new(config: &TokenConfig) -> Result<Self, TokenConfigError> {
        let key = config.secret.as_bytes();
        if key.len() < MIN_KEY_LEN {
            return Err(TokenConfigError::KeyTooShort {
                len: key.len(),
                min: MIN_KEY_LEN,
            });
        }

        let ttl = ChronoDuration::from_std(config.ttl)
            .map_err(|_| TokenConfigError::TtlOutOfRange { secs: config.ttl.as_secs() })?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);

        Ok(Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
            issuer: config.issuer.clone(),
            ttl,
        })
    }

    /// Issue a token for `subject` valid from now.
    pub fn issue(&self, subject: &str) -> Result<IssuedToken, TokenError> {
        self.issue_at(subject, Utc::now())
    }

    /// Issue a token for `subject` as if it were `issued_at`.
    pub fn issue_at(&self, subject: &str, issued_at: DateTime<Utc>) -> Result<IssuedToken, TokenError> {
        let expires_at = issued_at
            .checked_add_signed(self.ttl)
            .ok_or_else(|| TokenError::Signing(format!("expiry past {issued_at} overflows")))?;
        let claims = SessionClaims {
            sub: subject.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.issuer.clone(),
            typ: ACCESS_TOKEN_TYPE.to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Verify a token and return its subject.
    pub fn verify(&self, token: &str) -> Result<String, TokenError> {
        let data = decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map_err(map_jwt_error)?;
        let claims = data.claims;

        if claims.typ != ACCESS_TOKEN_TYPE || claims.sub.is_empty() {
            return Err(TokenError::Malformed);
        }

        Ok(claims.sub)
    }
}

/// Map JWT library errors to the three verification outcomes.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TokenError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidSignature => TokenError::InvalidSignature,
        _ => TokenError::Malformed,
    }
}

/// Short, non-reversible token identifier for log lines.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

// =============================================================================
// TESTS
// =============================================================================
