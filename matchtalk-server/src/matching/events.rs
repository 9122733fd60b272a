//! Match outcome events.
//!
//! Events are collected while the engine holds its lock and delivered through
//! a [`MatchNotifier`] after the lock is released.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of match outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchEventType {
    /// Request entered the waiting set.
    Queued,
    /// A compatible counterpart was found.
    MatchFound,
    /// The counterpart accepted the proposal.
    PartnerAccepted,
    /// The counterpart declined the proposal.
    PartnerDeclined,
    /// Both sides accepted; the room exists.
    BothConfirmed,
    /// The pairing is off.
    MatchCancelled,
    /// The request sat in the queue too long.
    RequestExpired,
}

/// Payload delivered to one participant's private match queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchEvent {
    /// What happened.
    pub event_type: MatchEventType,
    /// Recipient's own request.
    pub request_id: Uuid,
    /// Proposal, when one is involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<Uuid>,
    /// Room, once created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<u64>,
    /// Counterpart login id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<String>,
    /// Counterpart display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_display_name: Option<String>,
    /// True for exactly one side of a pair: the one that creates the media offer.
    pub should_create_offer: bool,
    /// Human readable summary.
    pub message: String,
}

impl MatchEvent {
    /// Event with only the mandatory fields set.
    pub fn new(event_type: MatchEventType, request_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            event_type,
            request_id,
            proposal_id: None,
            room_id: None,
            partner_id: None,
            partner_display_name: None,
            should_create_offer: false,
            message: message.into(),
        }
    }
}

/// Delivers match events to a named user.
#[async_trait]
pub trait MatchNotifier: Send + Sync {
    /// Deliver `event` to `recipient`'s private match queue.
    async fn notify(&self, recipient: &str, event: MatchEvent);
}

/// Events waiting to be delivered once the engine lock is released.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<(String, MatchEvent)>,
}

impl Outbox {
    /// Queue `event` for `recipient`.
    pub fn push(&mut self, recipient: &str, event: MatchEvent) {
        self.pending.push((recipient.to_string(), event));
    }

    /// Deliver everything in queue order.
    pub async fn deliver(self, notifier: &dyn MatchNotifier) {
        for (recipient, event) in self.pending {
            notifier.notify(&recipient, event).await;
        }
    }
}
