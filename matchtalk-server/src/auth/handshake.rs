//! Upgrade-time authentication.
//!
//! Runs once before a WebSocket upgrade completes. The bearer header wins,
//! the `token` query parameter is the fallback for clients that cannot set
//! headers on the upgrade request. The upgrade always proceeds; a failed
//! attempt is logged and the connection starts without a principal.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{bearer_token, AuthError, CredentialResolver};
use crate::core::identity::Principal;
use crate::core::token::fingerprint;

/// Query string accepted by the upgrade endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    /// Fallback bearer token.
    pub token: Option<String>,
}

/// Where the handshake credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// `Authorization` header.
    Header,
    /// `token` query parameter.
    Query,
}

/// Pick the handshake credential: header first, then query.
pub fn handshake_credential<'a>(
    headers: &'a HeaderMap,
    query_token: Option<&'a str>,
) -> Option<(&'a str, CredentialSource)> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(bearer_token)
        .map(|t| (t, CredentialSource::Header));

    from_header.or_else(|| {
        query_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| (t, CredentialSource::Query))
    })
}

/// Authenticate an upgrade request. Never fails; `None` means the connection
/// starts unauthenticated.
pub async fn authenticate_handshake(
    credentials: &CredentialResolver,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Option<Principal> {
    let Some((token, source)) = handshake_credential(headers, query_token) else {
        debug!("Handshake without credential, continuing unauthenticated");
        return None;
    };

    match credentials.authenticate(Some(token)).await {
        Ok(principal) => {
            info!("Handshake authenticated {} via {:?}", principal.subject_id, source);
            Some(principal)
        }
        Err(e) => {
            log_failure(e, source, token);
            None
        }
    }
}

fn log_failure(err: AuthError, source: CredentialSource, token: &str) {
    warn!(
        "Handshake credential rejected ({}) via {:?}, token {}; continuing unauthenticated",
        err,
        source,
        fingerprint(token)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::resolver;
    use axum::http::HeaderValue;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        headers
    }

    #[test]
    fn test_header_preferred_over_query() {
        let headers = bearer("from-header");
        assert_eq!(
            handshake_credential(&headers, Some("from-query")),
            Some(("from-header", CredentialSource::Header))
        );
        assert_eq!(
            handshake_credential(&HeaderMap::new(), Some("from-query")),
            Some(("from-query", CredentialSource::Query))
        );
        assert_eq!(handshake_credential(&HeaderMap::new(), Some("")), None);
    }

    #[tokio::test]
    async fn test_query_token_authenticates() {
        let (credentials, codec) = resolver().await;
        let token = codec.issue("bob").unwrap().token;

        let principal = authenticate_handshake(&credentials, &HeaderMap::new(), Some(&token)).await;
        assert_eq!(principal.unwrap().subject_id, "bob");
    }

    #[tokio::test]
    async fn test_bad_credentials_never_reject() {
        let (credentials, _) = resolver().await;

        assert!(authenticate_handshake(&credentials, &bearer("garbage"), None).await.is_none());
        assert!(authenticate_handshake(&credentials, &HeaderMap::new(), None).await.is_none());
        assert!(authenticate_handshake(&credentials, &HeaderMap::new(), Some("x.y.z")).await.is_none());
    }
}
