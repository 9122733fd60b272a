//! Transport Authentication
//!
//! One resolution contract, three entry points:
//!
//! - [`request`]: once per HTTP request, from the `Authorization` header.
//!   Never rejects; handlers that need a principal use the extractor.
//! - [`handshake`]: once per WebSocket upgrade, from the header or the
//!   `token` query parameter. Never rejects, only logs.
//! - [`frame`]: once per CONNECT frame inside an open connection. Reuses the
//!   handshake principal or validates the frame's own bearer, and rejects the
//!   session when neither yields a principal.

pub mod frame;
pub mod handshake;
pub mod request;

use std::sync::Arc;
use thiserror::Error;
use tracing::error;

use crate::core::identity::{IdentityResolver, Principal};
use crate::core::token::{TokenCodec, TokenError};

/// Authentication failures. Kept distinct for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential presented.
    #[error("missing credential")]
    Missing,
    /// Credential is not a well-formed access token.
    #[error("malformed credential")]
    Malformed,
    /// Signature mismatch.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token expired.
    #[error("expired credential")]
    Expired,
    /// Token is valid but its subject is unknown or disabled.
    #[error("unknown subject")]
    UnknownSubject,
}

impl From<TokenError> for AuthError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Expired => AuthError::Expired,
            TokenError::InvalidSignature => AuthError::InvalidSignature,
            TokenError::Malformed | TokenError::Signing(_) => AuthError::Malformed,
        }
    }
}

/// Shared resolution contract: raw bearer token in, principal out.
#[derive(Clone)]
pub struct CredentialResolver {
    codec: Arc<TokenCodec>,
    identities: IdentityResolver,
}

impl CredentialResolver {
    /// Resolver over a codec and identity source.
    pub fn new(codec: Arc<TokenCodec>, identities: IdentityResolver) -> Self {
        Self { codec, identities }
    }

    /// Verify `raw` and resolve its subject.
    pub async fn authenticate(&self, raw: Option<&str>) -> Result<Principal, AuthError> {
        let token = raw.map(str::trim).filter(|t| !t.is_empty()).ok_or(AuthError::Missing)?;
        let subject = self.codec.verify(token)?;

        match self.identities.resolve(&subject).await {
            Ok(Some(principal)) => Ok(principal),
            Ok(None) => Err(AuthError::UnknownSubject),
            Err(e) => {
                error!("Identity lookup failed for {}: {}", subject, e);
                Err(AuthError::UnknownSubject)
            }
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Resolver fixtures.

    use super::*;
    use crate::config::TokenConfig;
    use crate::core::store::testing::{directory, user};
    use crate::core::store::Gender;
    use chrono::NaiveDate;

    pub const SECRET: &str = "matchtalk-auth-test-secret-0123456789";

    pub fn codec() -> Arc<TokenCodec> {
        Arc::new(
            TokenCodec::new(&TokenConfig {
                secret: SECRET.into(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    /// Resolver knowing `alice` and `bob`, and the codec it verifies with.
    pub async fn resolver() -> (CredentialResolver, Arc<TokenCodec>) {
        let birth = NaiveDate::from_ymd_opt(1996, 5, 20).unwrap();
        let dir = directory(vec![
            user(1, "alice", Gender::F, birth, "pw"),
            user(2, "bob", Gender::M, birth, "pw"),
        ])
        .await;
        let codec = codec();
        let resolver = CredentialResolver::new(codec.clone(), IdentityResolver::new(Arc::new(dir)));
        (resolver, codec)
    }
}
