//! HTTP-facing errors
//!
//! Component errors convert into [`AppError`], which renders the uniform
//! `{"error": CODE, "message": ...}` body. Every authentication failure
//! collapses into one indistinguishable 401.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::accounts::LoginError;
use crate::auth::AuthError;
use crate::core::store::StoreError;
use crate::matching::MatchError;
use crate::rooms::RoomError;

/// Message returned for every authentication failure.
pub const GENERIC_AUTH_MESSAGE: &str = "Authentication required";

/// A request field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Offending field, in wire naming.
    pub field: String,
    /// Human readable constraint.
    pub message: String,
}

impl ValidationError {
    /// Build a validation error for `field`.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error type returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    /// Missing or invalid credentials, or a capability the principal lacks.
    #[error("unauthorized")]
    Unauthorized,

    /// Bad request shape or constraint.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Room, proposal or user absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Business rule refused the operation.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "UNAUTHORIZED", "message": GENERIC_AUTH_MESSAGE }),
            ),
            AppError::Validation(v) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "VALIDATION_FAILED", "field": v.field, "message": v.message }),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "NOT_FOUND", "message": msg }),
            ),
            AppError::Rejected(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "REJECTED", "message": msg }),
            ),
            AppError::Internal(detail) => {
                error!("Internal error: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "INTERNAL_ERROR", "message": "Internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(_: AuthError) -> Self {
        AppError::Unauthorized
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<RoomError> for AppError {
    fn from(e: RoomError) -> Self {
        match e {
            RoomError::NotFound(_) => AppError::NotFound(e.to_string()),
            RoomError::InvalidMembers(msg) => AppError::Validation(ValidationError::new("members", msg)),
            RoomError::TooManyTargets { .. } => AppError::Validation(ValidationError::new("targets", e.to_string())),
            RoomError::NotAMember { .. } | RoomError::NotGroupRoom(_) | RoomError::CapacityExceeded { .. } => {
                AppError::Rejected(e.to_string())
            }
        }
    }
}

impl From<MatchError> for AppError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::Validation(v) => AppError::Validation(v),
            MatchError::ProposalNotFound(_) => AppError::NotFound(e.to_string()),
            MatchError::Room(room) => room.into(),
        }
    }
}

impl From<LoginError> for AppError {
    fn from(e: LoginError) -> Self {
        match e {
            LoginError::InvalidCredentials => AppError::Unauthorized,
            LoginError::Locked { .. } | LoginError::Disabled => AppError::Rejected(e.to_string()),
            LoginError::Store(store) => store.into(),
            LoginError::Internal(detail) => AppError::Internal(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_auth_errors_are_indistinguishable() {
        let mut bodies = Vec::new();
        for e in [
            AuthError::Missing,
            AuthError::Malformed,
            AuthError::InvalidSignature,
            AuthError::Expired,
            AuthError::UnknownSubject,
        ] {
            bodies.push(body_json(AppError::from(e)).await);
        }

        for (status, body) in &bodies {
            assert_eq!(*status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, &bodies[0].1);
        }
        assert_eq!(bodies[0].1["message"], GENERIC_AUTH_MESSAGE);
    }

    #[tokio::test]
    async fn test_validation_carries_field() {
        let (status, body) = body_json(ValidationError::new("minAge", "must be at least 18").into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "VALIDATION_FAILED");
        assert_eq!(body["field"], "minAge");
    }

    #[tokio::test]
    async fn test_internal_detail_is_hidden() {
        let (status, body) = body_json(AppError::Internal("db exploded".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "Internal server error");
    }

    #[tokio::test]
    async fn test_bad_login_matches_missing_token() {
        let (_, login) = body_json(LoginError::InvalidCredentials.into()).await;
        let (_, missing) = body_json(AuthError::Missing.into()).await;
        assert_eq!(login, missing);
    }
}
