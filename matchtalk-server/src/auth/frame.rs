//! Session-initiation frame authentication.
//!
//! The first CONNECT frame on a connection either adopts the principal that
//! the handshake already resolved or authenticates the frame's own
//! `Authorization` header. Unlike the handshake, a failure here rejects the
//! session.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

use super::{bearer_token, AuthError, CredentialResolver};
use crate::core::identity::Principal;
use crate::core::token::fingerprint;

/// Per-connection identifier assigned by the broker.
pub type ConnectionId = u64;

/// CONNECT frame outcomes that are not a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameAuthError {
    /// The connection already completed CONNECT.
    #[error("connection already established")]
    AlreadyConnected,
    /// No principal could be established.
    #[error("session rejected: {0}")]
    Rejected(AuthError),
}

/// Authentication state owned by one connection.
#[derive(Debug)]
pub struct ConnectionContext {
    id: ConnectionId,
    handshake: Option<Principal>,
    session: Option<Principal>,
}

impl ConnectionContext {
    /// Fresh context carrying whatever the handshake resolved.
    pub fn new(id: ConnectionId, handshake: Option<Principal>) -> Self {
        Self {
            id,
            handshake,
            session: None,
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Principal of the established session, if CONNECT succeeded.
    pub fn principal(&self) -> Option<&Principal> {
        self.session.as_ref()
    }

    /// Principal resolved during the handshake, if any.
    pub fn handshake_principal(&self) -> Option<&Principal> {
        self.handshake.as_ref()
    }

    /// Drop all authentication state. Called when the connection closes.
    pub fn clear(&mut self) -> Option<Principal> {
        self.handshake = None;
        self.session.take()
    }
}

/// Look up a frame header ignoring ASCII case.
fn header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Authenticate a CONNECT frame.
pub async fn authenticate_connect(
    ctx: &mut ConnectionContext,
    credentials: &CredentialResolver,
    headers: &BTreeMap<String, String>,
) -> Result<Principal, FrameAuthError> {
    if ctx.session.is_some() {
        return Err(FrameAuthError::AlreadyConnected);
    }

    if let Some(principal) = ctx.handshake.clone() {
        info!("Connection {} reuses handshake principal {}", ctx.id, principal.subject_id);
        ctx.session = Some(principal.clone());
        return Ok(principal);
    }

    let token = header(headers, "authorization").and_then(bearer_token);
    match credentials.authenticate(token).await {
        Ok(principal) => {
            info!("Connection {} authenticated {} on CONNECT", ctx.id, principal.subject_id);
            ctx.session = Some(principal.clone());
            Ok(principal)
        }
        Err(e) => {
            warn!(
                "Connection {} CONNECT rejected: {} (token {})",
                ctx.id,
                e,
                token.map(fingerprint).unwrap_or_else(|| "none".into())
            );
            Err(FrameAuthError::Rejected(e))
        }
    }
}
