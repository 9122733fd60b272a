//! Realtime Relay
//!
//! Routes application frames from authenticated connections: chat into
//! rooms, signaling envelopes to one peer, and match outcome events to the
//! owner's private queue. The sender is always the connection's principal,
//! whatever the payload claims.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::broker::Broker;
use super::protocol::{
    room_topic, AppDestination, ChatMessage, ChatMessageRequest, ContentType, SignalEnvelope, SubscriptionTarget,
    MATCH_RESULTS_QUEUE, SIGNAL_QUEUE,
};
use crate::core::identity::{Capability, Principal};
use crate::core::store::{MessageStore, Storage, StoreError, Translator, UserDirectory};
use crate::error::ValidationError;
use crate::matching::events::{MatchEvent, MatchNotifier};
use crate::rooms::RoomProvisioner;

/// Why a frame was refused. Reported to the sender in an ERROR frame.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No route for the destination.
    #[error("unknown destination {0}")]
    UnknownDestination(String),
    /// Principal lacks a capability or membership.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Payload failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Payload did not parse.
    #[error("invalid payload: {0}")]
    BadPayload(#[from] serde_json::Error),
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Relay over the broker and room membership.
pub struct Relay {
    broker: Arc<Broker>,
    rooms: Arc<RoomProvisioner>,
    messages: Arc<dyn MessageStore>,
    translator: Arc<dyn Translator>,
    users: Arc<dyn UserDirectory>,
}

impl Relay {
    /// Relay delivering through `broker`.
    pub fn new(broker: Arc<Broker>, rooms: Arc<RoomProvisioner>, storage: &Storage) -> Self {
        Self {
            broker,
            rooms,
            messages: storage.messages.clone(),
            translator: storage.translator.clone(),
            users: storage.users.clone(),
        }
    }

    /// Dispatch a SEND frame.
    pub async fn route(&self, principal: &Principal, destination: &str, body: Value) -> Result<(), RelayError> {
        match AppDestination::parse(destination) {
            Some(AppDestination::ChatSend(room_id)) => {
                let request: ChatMessageRequest = serde_json::from_value(body)?;
                self.send_chat(principal, room_id, request).await.map(|_| ())
            }
            Some(AppDestination::Signal) => {
                let envelope: SignalEnvelope = serde_json::from_value(body)?;
                self.send_signal(principal, envelope).await
            }
            None => Err(RelayError::UnknownDestination(destination.to_string())),
        }
    }

    /// Persist, translate and broadcast a chat message.
    pub async fn send_chat(
        &self,
        principal: &Principal,
        room_id: u64,
        request: ChatMessageRequest,
    ) -> Result<ChatMessage, RelayError> {
        if !principal.can(Capability::Chat) {
            return Err(RelayError::Forbidden("chat not permitted".into()));
        }
        request.validate()?;
        if !self.rooms.is_active_member(room_id, &principal.subject_id).await {
            return Err(RelayError::Forbidden(format!("not a member of room {room_id}")));
        }

        let mut message = ChatMessage {
            message_id: 0,
            room_id,
            sender_id: principal.subject_id.clone(),
            sender_display_name: principal.display_name.clone(),
            content_type: request.content_type,
            content: request.content,
            translated_content: None,
            target_lang: None,
            attachment: request.attachment,
            created_at: Utc::now(),
        };
        self.translate(&mut message).await;

        let message = self.messages.append(message).await?;
        let body = serde_json::to_value(&message)?;
        let delivered = self.broker.publish(&room_topic(room_id), body).await;
        debug!(
            "Chat {} from {} in room {} delivered {} times",
            message.message_id, message.sender_id, room_id, delivered
        );
        Ok(message)
    }

    async fn translate(&self, message: &mut ChatMessage) {
        if message.content_type != ContentType::Text {
            return;
        }
        let Some(text) = message.content.as_deref() else {
            return;
        };
        let target = match self.users.find(&message.sender_id).await {
            Ok(record) => record.and_then(|r| r.translate_to),
            Err(e) => {
                warn!("Language preference lookup failed for {}: {}", message.sender_id, e);
                None
            }
        };
        let Some(target) = target else {
            return;
        };

        match self.translator.translate(text, &target).await {
            Ok(Some(translated)) => {
                message.translated_content = Some(translated);
                message.target_lang = Some(target);
            }
            Ok(None) => {}
            Err(e) => warn!("Translation to {} failed, sending original: {}", target, e),
        }
    }

    /// Relay a signaling envelope to its recipient.
    pub async fn send_signal(&self, principal: &Principal, mut envelope: SignalEnvelope) -> Result<(), RelayError> {
        if !principal.can(Capability::Signal) {
            return Err(RelayError::Forbidden("signaling not permitted".into()));
        }
        let receiver = envelope
            .receiver_id
            .clone()
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| ValidationError::new("receiverId", "must not be blank"))?;

        if let Some(claimed) = envelope.sender_id.as_deref().filter(|c| *c != principal.subject_id) {
            warn!("Signal sender {} overwritten with {}", claimed, principal.subject_id);
        }
        envelope.sender_id = Some(principal.subject_id.clone());

        let body = serde_json::to_value(&envelope)?;
        self.broker.send_to_user(&receiver, SIGNAL_QUEUE, body).await;
        debug!("Signal {} from {} to {}", envelope.kind, principal.subject_id, receiver);
        Ok(())
    }

    /// Check a SUBSCRIBE destination for `principal`.
    pub async fn authorize_subscription(
        &self,
        principal: &Principal,
        destination: &str,
    ) -> Result<SubscriptionTarget, RelayError> {
        let target = SubscriptionTarget::parse(destination)
            .ok_or_else(|| RelayError::UnknownDestination(destination.to_string()))?;
        if let SubscriptionTarget::RoomTopic(room_id) = target {
            if !self.rooms.is_active_member(room_id, &principal.subject_id).await {
                return Err(RelayError::Forbidden(format!("not a member of room {room_id}")));
            }
        }
        Ok(target)
    }
}

#[async_trait]
impl MatchNotifier for Relay {
    async fn notify(&self, recipient: &str, event: MatchEvent) {
        match serde_json::to_value(&event) {
            Ok(body) => {
                self.broker.send_to_user(recipient, MATCH_RESULTS_QUEUE, body).await;
            }
            Err(e) => warn!("Failed to encode match event for {}: {}", recipient, e),
        }
    }
}
