//! Per-conversation message sequence

use std::time::Duration;

use uuid::Uuid;

use crate::types::{DeliveryStatus, Message};

/// Messages of one conversation, unique by server id
///
/// Stored in arrival order; [`MessageSequence::ordered`] is the display
/// projection.
#[derive(Debug, Clone, Default)]
pub struct MessageSequence {
    messages: Vec<Message>,
}

impl MessageSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id.as_deref() == Some(id))
    }

    /// Position of the provisional message carrying `key`
    pub fn find_provisional(&self, key: Uuid) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.is_provisional() && m.client_key == Some(key))
    }

    /// Oldest own provisional message that `echo` plausibly confirms
    ///
    /// Only used when the server did not echo the client key: same sender,
    /// same text, timestamps within `window`.
    pub fn find_echo_candidate(&self, echo: &Message, window: Duration) -> Option<usize> {
        let echo_text = echo.text()?;
        let window = chrono::Duration::from_std(window).ok()?;
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.is_provisional()
                    && m.sender_id == echo.sender_id
                    && m.text() == Some(echo_text)
                    && (m.timestamp - echo.timestamp).abs() <= window
            })
            .min_by_key(|(_, m)| m.timestamp)
            .map(|(idx, _)| idx)
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Promote the provisional message at `idx` to its confirmed form
    ///
    /// The client key is kept so later duplicates of the echo still match.
    pub fn confirm(&mut self, idx: usize, confirmed: &Message) -> Option<&Message> {
        let slot = self.messages.get_mut(idx)?;
        let client_key = slot.client_key.or(confirmed.client_key);
        let status = slot.status.max(confirmed.status);
        *slot = confirmed.clone();
        slot.client_key = client_key;
        slot.status = status;
        Some(slot)
    }

    /// Raise the status of a confirmed message; never downgrades
    pub fn upgrade_status(&mut self, id: &str, status: DeliveryStatus) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|m| m.id.as_deref() == Some(id))
        {
            Some(message) if status > message.status => {
                message.status = status;
                true
            }
            _ => false,
        }
    }

    /// Messages sorted by timestamp; ties keep arrival order
    pub fn ordered(&self) -> Vec<&Message> {
        let mut ordered: Vec<&Message> = self.messages.iter().collect();
        ordered.sort_by_key(|m| m.timestamp);
        ordered
    }
}
