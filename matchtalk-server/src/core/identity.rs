//! Identity Resolution
//!
//! Turns a verified token subject into a [`Principal`]. All three transport
//! authenticators go through the same resolver, so a subject that is unknown
//! or disabled is refused the same way everywhere.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

use super::store::{Role, StoreError, UserDirectory, UserRecord};

/// Something a principal is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    /// Send chat messages to rooms the user belongs to.
    Chat,
    /// Enter the matching queue and decide on proposals.
    Match,
    /// Relay signaling envelopes to peers.
    Signal,
    /// Moderation actions.
    Moderate,
}

impl Role {
    /// Capabilities granted by this role.
    pub fn capabilities(self) -> BTreeSet<Capability> {
        let mut caps: BTreeSet<Capability> = [Capability::Chat, Capability::Match, Capability::Signal]
            .into_iter()
            .collect();
        if self == Role::Admin {
            caps.insert(Capability::Moderate);
        }
        caps
    }
}

/// An authenticated identity. Lives for one request or one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Login id of the user.
    pub subject_id: String,
    /// Name shown to other users.
    pub display_name: String,
    /// Granted capabilities.
    pub capabilities: BTreeSet<Capability>,
}

impl Principal {
    /// Principal for a directory record.
    pub fn from_record(record: &UserRecord) -> Self {
        Self {
            subject_id: record.login_id.clone(),
            display_name: record.display_name.clone(),
            capabilities: record.role.capabilities(),
        }
    }

    /// Whether the principal holds `capability`.
    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Resolves subjects against the user directory.
#[derive(Clone)]
pub struct IdentityResolver {
    directory: Arc<dyn UserDirectory>,
}

impl IdentityResolver {
    /// Resolver backed by `directory`.
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }

    /// Principal for `subject`, or `None` if the user is unknown or disabled.
    pub async fn resolve(&self, subject: &str) -> Result<Option<Principal>, StoreError> {
        let Some(record) = self.directory.find(subject).await? else {
            return Ok(None);
        };
        if !record.enabled {
            warn!("Refusing principal for disabled account {}", subject);
            return Ok(None);
        }
        Ok(Some(Principal::from_record(&record)))
    }
}
