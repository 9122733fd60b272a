//! Protocol Messages
//!
//! Realtime frames are JSON objects tagged by `command`. Clients send to the
//! `/app` namespace, subscribe to `/topic/rooms/{id}` for room broadcasts
//! and to `/user/queue/*` for their private queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ValidationError;

/// Client chat sends.
pub const CHAT_SEND_PREFIX: &str = "/app/chat.sendMessage/";
/// Client signaling sends.
pub const SIGNAL_DESTINATION: &str = "/app/signal";
/// Room broadcast topics.
pub const ROOM_TOPIC_PREFIX: &str = "/topic/rooms/";
/// Private queue namespace.
pub const USER_QUEUE_PREFIX: &str = "/user/queue/";
/// Private queue for match outcome events.
pub const MATCH_RESULTS_QUEUE: &str = "/user/queue/match-results";
/// Private queue for signaling envelopes.
pub const SIGNAL_QUEUE: &str = "/user/queue/signals";

/// Longest accepted text message, in characters.
pub const MAX_CHAT_LENGTH: usize = 2000;

/// Heart-beat advertised in CONNECTED. Heart-beating is not negotiated.
const NO_HEART_BEAT: &str = "0,0";

// =============================================================================
// CLIENT -> SERVER FRAMES
// =============================================================================

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Session initiation.
    Connect {
        /// Frame headers; `Authorization` may carry a bearer token.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Start receiving a destination.
    Subscribe {
        /// Client-chosen subscription id.
        id: String,
        /// Topic or private queue.
        destination: String,
    },
    /// Stop a subscription.
    Unsubscribe {
        /// Subscription id given at SUBSCRIBE.
        id: String,
    },
    /// Application message.
    Send {
        /// `/app/...` destination.
        destination: String,
        /// Payload.
        #[serde(default)]
        body: Value,
    },
    /// Graceful goodbye.
    Disconnect,
}

impl ClientFrame {
    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Command name, for logs.
    pub fn command(&self) -> &'static str {
        match self {
            ClientFrame::Connect { .. } => "CONNECT",
            ClientFrame::Subscribe { .. } => "SUBSCRIBE",
            ClientFrame::Unsubscribe { .. } => "UNSUBSCRIBE",
            ClientFrame::Send { .. } => "SEND",
            ClientFrame::Disconnect => "DISCONNECT",
        }
    }
}

// =============================================================================
// SERVER -> CLIENT FRAMES
// =============================================================================

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// Session established.
    Connected {
        /// Authenticated login id.
        user: String,
        /// Always `0,0`.
        #[serde(rename = "heartBeat")]
        heart_beat: String,
    },
    /// Delivery on a subscription.
    Message {
        /// Subscription id the delivery matched.
        subscription: String,
        /// Destination as subscribed.
        destination: String,
        /// Payload.
        body: Value,
    },
    /// Something went wrong with a frame.
    Error {
        /// Human readable reason.
        message: String,
        /// Destination of the failed frame, if any.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        destination: Option<String>,
    },
}

impl ServerFrame {
    /// CONNECTED frame for `user`.
    pub fn connected(user: &str) -> Self {
        ServerFrame::Connected {
            user: user.to_string(),
            heart_beat: NO_HEART_BEAT.to_string(),
        }
    }

    /// ERROR frame.
    pub fn error(message: impl Into<String>, destination: Option<&str>) -> Self {
        ServerFrame::Error {
            message: message.into(),
            destination: destination.map(str::to_string),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// DESTINATIONS
// =============================================================================

/// Where a SEND frame is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppDestination {
    /// Chat message into a room.
    ChatSend(u64),
    /// Signaling envelope.
    Signal,
}

impl AppDestination {
    /// Parse a SEND destination.
    pub fn parse(destination: &str) -> Option<Self> {
        if destination == SIGNAL_DESTINATION {
            return Some(AppDestination::Signal);
        }
        destination
            .strip_prefix(CHAT_SEND_PREFIX)
            .and_then(|id| id.parse().ok())
            .map(AppDestination::ChatSend)
    }
}

/// What a SUBSCRIBE frame is asking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    /// Room broadcast.
    RoomTopic(u64),
    /// One of the subscriber's own private queues.
    UserQueue(String),
}

impl SubscriptionTarget {
    /// Parse a SUBSCRIBE destination.
    pub fn parse(destination: &str) -> Option<Self> {
        if let Some(id) = destination.strip_prefix(ROOM_TOPIC_PREFIX) {
            return id.parse().ok().map(SubscriptionTarget::RoomTopic);
        }
        match destination {
            MATCH_RESULTS_QUEUE | SIGNAL_QUEUE => Some(SubscriptionTarget::UserQueue(destination.to_string())),
            _ => None,
        }
    }
}

/// Broadcast topic of `room_id`.
pub fn room_topic(room_id: u64) -> String {
    format!("{ROOM_TOPIC_PREFIX}{room_id}")
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Kind of chat content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    /// Plain text.
    #[default]
    Text,
    /// Image attachment.
    Image,
    /// Other file attachment.
    File,
}

/// Attachment already uploaded elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Where the file lives.
    pub url: String,
    /// Original name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Body of a chat SEND. Any sender field a client adds is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageRequest {
    /// Content kind.
    #[serde(default)]
    pub content_type: ContentType,
    /// Text content.
    #[serde(default)]
    pub content: Option<String>,
    /// Attachment for IMAGE and FILE.
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

impl ChatMessageRequest {
    /// Check that the content matches its kind.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.content_type {
            ContentType::Text => {
                let text = self.content.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    return Err(ValidationError::new("content", "must not be blank"));
                }
                if text.chars().count() > MAX_CHAT_LENGTH {
                    return Err(ValidationError::new(
                        "content",
                        format!("at most {MAX_CHAT_LENGTH} characters"),
                    ));
                }
            }
            ContentType::Image | ContentType::File => {
                if self.attachment.as_ref().map_or(true, |a| a.url.trim().is_empty()) {
                    return Err(ValidationError::new("attachment", "required for this content type"));
                }
            }
        }
        Ok(())
    }
}

/// A persisted chat message as broadcast to the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Assigned by the message store.
    pub message_id: u64,
    /// Room it was sent to.
    pub room_id: u64,
    /// Authenticated sender login id.
    pub sender_id: String,
    /// Sender display name.
    pub sender_display_name: String,
    /// Content kind.
    pub content_type: ContentType,
    /// Original text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Translated text, when translation ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_content: Option<String>,
    /// Language of `translated_content`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_lang: Option<String>,
    /// Attachment for IMAGE and FILE.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Server receive time.
    pub created_at: DateTime<Utc>,
}

/// Media negotiation envelope relayed between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// offer, answer, ice-candidate, ...
    #[serde(rename = "type")]
    pub kind: String,
    /// Always overwritten with the authenticated sender.
    #[serde(default)]
    pub sender_id: Option<String>,
    /// Recipient login id.
    #[serde(default)]
    pub receiver_id: Option<String>,
    /// Opaque negotiation payload.
    #[serde(default)]
    pub data: Value,
}
