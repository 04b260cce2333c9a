//! Message types
//!
//! A message is either provisional (created locally, keyed by a
//! client-generated idempotency key) or confirmed (carries the server id).
//! The server echoes the client key back so the two can be matched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status, ordered so upgrades can be checked with `>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    File,
    System,
}

/// Message body. Attachments are references to already uploaded media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    Text {
        text: String,
    },
    Attachment {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePayload::Text { text: text.into() }
    }

    /// Text used for previews and echo matching
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessagePayload::Text { text } => Some(text),
            MessagePayload::Attachment { caption, .. } => caption.as_deref(),
        }
    }
}

/// Identity of a message within its conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    /// Server-assigned id
    Confirmed(String),
    /// Client idempotency key, not yet acknowledged
    Provisional(Uuid),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<Uuid>,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: MessagePayload,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: DeliveryStatus,
}

impl Message {
    /// Build a provisional message with a fresh idempotency key
    pub fn provisional(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        message_type: MessageType,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: None,
            client_key: Some(Uuid::new_v4()),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            recipient_id: None,
            message_type,
            payload,
            timestamp: Utc::now(),
            status: DeliveryStatus::Sent,
        }
    }

    /// Build a confirmed text message, as the server would deliver it
    pub fn confirmed_text(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            client_key: None,
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            recipient_id: None,
            message_type: MessageType::Text,
            payload: MessagePayload::text(text),
            timestamp,
            status: DeliveryStatus::Sent,
        }
    }

    /// Key used for deduplication; `None` only for malformed messages
    pub fn key(&self) -> Option<MessageKey> {
        match (&self.id, self.client_key) {
            (Some(id), _) => Some(MessageKey::Confirmed(id.clone())),
            (None, Some(key)) => Some(MessageKey::Provisional(key)),
            (None, None) => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id.is_none()
    }

    pub fn text(&self) -> Option<&str> {
        self.payload.as_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisional_key() {
        let msg = Message::provisional("c1", "u1", MessageType::Text, MessagePayload::text("hi"));
        assert!(msg.is_provisional());
        assert!(matches!(msg.key(), Some(MessageKey::Provisional(_))));
        assert_eq!(msg.status, DeliveryStatus::Sent);
    }

    #[test]
    fn test_wire_shape() {
        let json = r#"{
            "id": "m-1",
            "conversationId": "c-1",
            "senderId": "v-1",
            "type": "text",
            "payload": {"kind": "text", "text": "hello"},
            "timestamp": "2024-03-01T10:00:00Z"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.key(), Some(MessageKey::Confirmed("m-1".to_string())));
        assert_eq!(msg.text(), Some("hello"));
        assert_eq!(msg.status, DeliveryStatus::Sent);
    }

    #[test]
    fn test_status_ordering() {
        assert!(DeliveryStatus::Read > DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered > DeliveryStatus::Sent);
    }
}
