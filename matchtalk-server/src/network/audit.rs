//! Connection lifecycle audit log.

use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

use crate::auth::frame::ConnectionId;

const MASK: &str = "****";
const SENSITIVE: [&str; 2] = ["authorization", "passcode"];

/// Lifecycle step being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// CONNECT frame received.
    Connect,
    /// Session established.
    Connected,
    /// SUBSCRIBE accepted.
    Subscribe,
    /// Connection closed.
    Disconnect,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Connect => "CONNECT",
            Lifecycle::Connected => "CONNECTED",
            Lifecycle::Subscribe => "SUBSCRIBE",
            Lifecycle::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

/// Copy of `headers` with credentials masked.
pub fn sanitize_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            let value = if SENSITIVE.iter().any(|s| k.eq_ignore_ascii_case(s)) {
                MASK.to_string()
            } else {
                v.clone()
            };
            (k.clone(), value)
        })
        .collect()
}

/// Emit one audit line.
pub fn record(step: Lifecycle, connection: ConnectionId, principal: Option<&str>, detail: &str) {
    info!(
        target: "matchtalk::audit",
        "{} conn={} user={} {}",
        step,
        connection,
        principal.unwrap_or("anonymous"),
        detail
    );
}

/// Audit a CONNECT frame and its masked headers.
pub fn record_connect(connection: ConnectionId, principal: Option<&str>, headers: &BTreeMap<String, String>) {
    record(
        Lifecycle::Connect,
        connection,
        principal,
        &format!("headers={:?}", sanitize_headers(headers)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_masked() {
        let headers = BTreeMap::from([
            ("Authorization".to_string(), "Bearer secret".to_string()),
            ("accept-version".to_string(), "1.2".to_string()),
        ]);
        let clean = sanitize_headers(&headers);
        assert_eq!(clean["Authorization"], "****");
        assert_eq!(clean["accept-version"], "1.2");
        assert!(!format!("{clean:?}").contains("secret"));
    }

    #[test]
    fn test_lifecycle_names() {
        assert_eq!(Lifecycle::Connected.to_string(), "CONNECTED");
        assert_eq!(Lifecycle::Disconnect.to_string(), "DISCONNECT");
    }
}
