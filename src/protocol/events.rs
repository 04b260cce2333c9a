//! Push channel event types
//!
//! Frames are JSON text of the form `{"event": <name>, "data": <payload>}`.
//! Both directions are closed enums: anything that does not parse into one
//! of the known shapes is rejected before it reaches a store.

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};
use crate::types::{Message, Notification};

/// Events delivered by the server (or synthesized from transport lifecycle)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The channel is open and authenticated
    Connect,

    /// The transport failed to establish a connection
    ConnectError { message: String },

    /// Server-side error, including authentication rejection
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// The transport is about to retry
    ReconnectAttempt {
        #[serde(default)]
        attempt: u32,
    },

    /// A confirmed message for one of our conversations
    NewMessage(Message),

    /// A notification addressed to us
    NewNotification(Notification),
}

/// Discriminant used to register handlers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    ConnectError,
    Error,
    ReconnectAttempt,
    NewMessage,
    NewNotification,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::ConnectError => "connect_error",
            EventKind::Error => "error",
            EventKind::ReconnectAttempt => "reconnect_attempt",
            EventKind::NewMessage => "new_message",
            EventKind::NewNotification => "new_notification",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ServerEvent {
    /// Parse and validate a text frame
    pub fn parse(frame: &str) -> ChatResult<Self> {
        let event: ServerEvent = serde_json::from_str(frame)
            .map_err(|e| ChatError::Protocol(format!("unrecognized frame: {}", e)))?;
        event.validate()?;
        Ok(event)
    }

    /// Reject shapes that deserialize but cannot be applied
    fn validate(&self) -> ChatResult<()> {
        match self {
            ServerEvent::NewMessage(message) => {
                if message.conversation_id.is_empty() {
                    return Err(ChatError::Protocol("new_message without conversationId".into()));
                }
                if message.id.as_deref().map_or(true, str::is_empty) {
                    return Err(ChatError::Protocol("new_message without server id".into()));
                }
                Ok(())
            }
            ServerEvent::NewNotification(notification) if notification.id.is_empty() => {
                Err(ChatError::Protocol("new_notification without id".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Connect => EventKind::Connect,
            ServerEvent::ConnectError { .. } => EventKind::ConnectError,
            ServerEvent::Error { .. } => EventKind::Error,
            ServerEvent::ReconnectAttempt { .. } => EventKind::ReconnectAttempt,
            ServerEvent::NewMessage(_) => EventKind::NewMessage,
            ServerEvent::NewNotification(_) => EventKind::NewNotification,
        }
    }

    /// Whether this is the server rejecting our credentials
    ///
    /// A structured `code` wins; older servers only put "Unauthorized" in
    /// the message text.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            ServerEvent::Error { code: Some(code), .. } => code.eq_ignore_ascii_case("unauthorized"),
            ServerEvent::Error { message, code: None } => {
                message.to_ascii_lowercase().contains("unauthorized")
            }
            _ => false,
        }
    }
}

/// Payload of an outbound `send_message`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub message: Message,
    pub recipient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_name: Option<String>,
}

/// Events sent by the client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage(OutboundMessage),
}

impl ClientEvent {
    pub fn to_frame(&self) -> ChatResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Server event tagged with its position in one connection's stream
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Connection instance the event arrived on
    pub instance: u64,
    /// Monotonically increasing per instance, starting at 0
    pub sequence: u64,
    pub event: ServerEvent,
}
