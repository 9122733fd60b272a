//! Request-scoped authentication.
//!
//! [`resolve_principal`] runs once per HTTP request. It attaches a
//! [`Principal`] to the request extensions when the bearer header verifies and
//! otherwise lets the request through untouched. Handlers that require an
//! identity take [`Authenticated`], which fails with the generic 401.

use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use tracing::debug;

use super::{bearer_token, AuthError, CredentialResolver};
use crate::core::identity::{Capability, Principal};
use crate::core::token::fingerprint;
use crate::error::AppError;

/// Middleware: resolve the bearer header, never reject.
pub async fn resolve_principal(
    State(credentials): State<CredentialResolver>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_owned);

    match credentials.authenticate(token.as_deref()).await {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
        }
        Err(AuthError::Missing) => {}
        Err(e) => {
            debug!(
                "Request {} {} continues unauthenticated: {} (token {})",
                request.method(),
                request.uri().path(),
                e,
                token.as_deref().map(fingerprint).unwrap_or_default()
            );
        }
    }

    next.run(request).await
}

/// Extractor for handlers that require a principal.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Principal);

impl Authenticated {
    /// Fail with 401 unless the principal holds `capability`.
    pub fn require(&self, capability: Capability) -> Result<&Principal, AppError> {
        if self.0.can(capability) {
            Ok(&self.0)
        } else {
            Err(AppError::Unauthorized)
        }
    }
}

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(Authenticated)
            .ok_or(AppError::Unauthorized)
    }
}

impl<S> OptionalFromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<Principal>().cloned().map(Authenticated))
    }
}
