//! Conversation store
//!
//! In-memory conversations and their message sequences for one identity.
//! The store is single-writer: callers hold it behind a lock and only its
//! own operations mutate it. Every operation is idempotent with respect to
//! server ids, so replayed pushes and overlapping REST pages are harmless.
//!
//! Sent messages go through two phases. [`ConversationStore::send_message`]
//! appends a provisional message keyed by a fresh client key; the server's
//! echo is later matched back to it (by echoed key, or by a bounded
//! same-text heuristic when the key is missing) and promoted in place.

mod grouping;
mod sequence;

pub use grouping::{group_by_date, DateGroup};
pub use sequence::MessageSequence;

use std::collections::HashMap;
use std::time::Duration;

use chrono::TimeZone;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult};
use crate::protocol::{ClientEvent, OutboundMessage};
use crate::types::{
    Conversation, DeliveryStatus, Identity, Message, MessagePayload, MessageType, Participants,
};

/// Result of applying an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New message added to the sequence
    Appended,
    /// Server id already known; nothing changed
    Duplicate,
    /// Confirmed one of our provisional messages
    Reconciled,
}

/// Read receipt to hand to the REST collaborator after selecting a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: String,
    pub reader_id: String,
}

/// What the UI provides to send a message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub conversation_id: String,
    pub recipient_id: String,
    pub recipient_name: Option<String>,
    pub message_type: MessageType,
    pub payload: MessagePayload,
}

impl MessageDraft {
    pub fn text(
        conversation_id: impl Into<String>,
        recipient_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            recipient_id: recipient_id.into(),
            recipient_name: None,
            message_type: MessageType::Text,
            payload: MessagePayload::text(text),
        }
    }

    pub fn with_recipient_name(mut self, name: impl Into<String>) -> Self {
        self.recipient_name = Some(name.into());
        self
    }
}

/// Echo matching settings
#[derive(Debug, Clone, Copy)]
struct EchoPolicy {
    heuristic: bool,
    window: Duration,
}

#[derive(Debug)]
pub struct ConversationStore {
    me: Identity,
    conversations: HashMap<String, Conversation>,
    sequences: HashMap<String, MessageSequence>,
    selected: Option<String>,
    echo: EchoPolicy,
}

impl ConversationStore {
    pub fn new(me: Identity, echo_heuristic: bool, echo_window: Duration) -> Self {
        Self {
            me,
            conversations: HashMap::new(),
            sequences: HashMap::new(),
            selected: None,
            echo: EchoPolicy {
                heuristic: echo_heuristic,
                window: echo_window,
            },
        }
    }

    pub fn from_config(me: Identity, config: &ClientConfig) -> Self {
        Self::new(me, config.echo_heuristic, config.echo_window)
    }

    pub fn identity(&self) -> &Identity {
        &self.me
    }

    /// Merge a page of conversations from the server
    ///
    /// Participants come from the server. The preview is only replaced by a
    /// message at least as recent as the current one, and the unread count
    /// of the selected conversation stays at zero.
    pub fn upsert_conversations(&mut self, incoming: Vec<Conversation>) {
        for conversation in incoming {
            let is_selected = self.is_selected(&conversation.id);
            match self.conversations.get_mut(&conversation.id) {
                Some(existing) => {
                    existing.participants = conversation.participants;
                    if let Some(last) = &conversation.last_message {
                        existing.offer_last_message(last);
                    }
                    existing.unread_count = if is_selected {
                        0
                    } else {
                        conversation.unread_count
                    };
                }
                None => {
                    let mut conversation = conversation;
                    if is_selected {
                        conversation.unread_count = 0;
                    }
                    self.sequences.entry(conversation.id.clone()).or_default();
                    self.conversations
                        .insert(conversation.id.clone(), conversation);
                }
            }
        }
    }

    /// Apply a confirmed message from the push channel
    pub fn append_message(&mut self, message: Message) -> ChatResult<AppendOutcome> {
        let Some(id) = message.id.clone() else {
            return Err(ChatError::Reconciliation {
                conversation_id: message.conversation_id,
                detail: "inbound message has no server id".into(),
            });
        };

        if self
            .sequences
            .get(&message.conversation_id)
            .map_or(false, |seq| seq.contains_id(&id))
        {
            trace!(%id, "duplicate message ignored");
            return Ok(AppendOutcome::Duplicate);
        }

        if let Some(idx) = self.find_own_provisional(&message) {
            self.confirm_provisional(idx, &message);
            debug!(%id, conversation = %message.conversation_id, "provisional message confirmed");
            return Ok(AppendOutcome::Reconciled);
        }

        self.ensure_conversation(&message)?;
        let from_me = message.sender_id == self.me.id;
        let is_selected = self.is_selected(&message.conversation_id);

        if let Some(conversation) = self.conversations.get_mut(&message.conversation_id) {
            conversation.offer_last_message(&message);
            if !is_selected && !from_me {
                conversation.unread_count += 1;
            }
        }
        self.sequences
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
        Ok(AppendOutcome::Appended)
    }

    /// Mark a conversation active and zero its unread count
    pub fn select_conversation(&mut self, conversation_id: &str) -> ReadReceipt {
        self.selected = Some(conversation_id.to_string());
        if let Some(conversation) = self.conversations.get_mut(conversation_id) {
            conversation.unread_count = 0;
        }
        ReadReceipt {
            conversation_id: conversation_id.to_string(),
            reader_id: self.me.id.clone(),
        }
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Append a provisional message and build the outbound event for it
    ///
    /// Unread counts are left alone; the preview is updated immediately.
    pub fn send_message(&mut self, draft: MessageDraft) -> ClientEvent {
        let mut message = Message::provisional(
            draft.conversation_id.clone(),
            self.me.id.clone(),
            draft.message_type,
            draft.payload,
        );
        message.recipient_id = Some(draft.recipient_id.clone());

        let me = self.me.clone();
        let conversation = self
            .conversations
            .entry(draft.conversation_id.clone())
            .or_insert_with(|| {
                Conversation::new(
                    draft.conversation_id.clone(),
                    Participants::from_pair(&me, &draft.recipient_id),
                )
            });
        conversation.offer_last_message(&message);
        self.sequences
            .entry(draft.conversation_id)
            .or_default()
            .push(message.clone());

        ClientEvent::SendMessage(OutboundMessage {
            message,
            recipient_id: draft.recipient_id,
            recipient_name: draft.recipient_name,
        })
    }

    /// Merge a page of history loaded over REST
    ///
    /// Returns how many messages were new. Unread counts are untouched.
    pub fn merge_history(&mut self, conversation_id: &str, messages: Vec<Message>) -> usize {
        let mut added = 0;
        for message in messages {
            let Some(id) = message.id.as_deref() else {
                debug!(conversation = conversation_id, "skipping history entry without id");
                continue;
            };
            if message.conversation_id != conversation_id {
                debug!(%id, conversation = conversation_id, "skipping history entry for another conversation");
                continue;
            }
            let sequence = self.sequences.entry(conversation_id.to_string()).or_default();
            if sequence.contains_id(id) {
                continue;
            }
            if let Some(idx) = message.client_key.and_then(|key| sequence.find_provisional(key)) {
                self.confirm_provisional(idx, &message);
                continue;
            }
            if let Some(conversation) = self.conversations.get_mut(conversation_id) {
                conversation.offer_last_message(&message);
            }
            sequence.push(message);
            added += 1;
        }
        added
    }

    pub fn mark_delivered(&mut self, conversation_id: &str, message_id: &str) -> bool {
        self.mark_status(conversation_id, message_id, DeliveryStatus::Delivered)
    }

    pub fn mark_read(&mut self, conversation_id: &str, message_id: &str) -> bool {
        self.mark_status(conversation_id, message_id, DeliveryStatus::Read)
    }

    /// Upgrade a message's delivery status; downgrades are ignored
    pub fn mark_status(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        status: DeliveryStatus,
    ) -> bool {
        let upgraded = self
            .sequences
            .get_mut(conversation_id)
            .map_or(false, |seq| seq.upgrade_status(message_id, status));
        if upgraded {
            if let Some(last) = self
                .conversations
                .get_mut(conversation_id)
                .and_then(|c| c.last_message.as_mut())
                .filter(|m| m.id.as_deref() == Some(message_id))
            {
                last.status = last.status.max(status);
            }
        }
        upgraded
    }

    /// Conversations, most recent activity first
    pub fn conversations(&self) -> Vec<&Conversation> {
        let mut list: Vec<&Conversation> = self.conversations.values().collect();
        list.sort_by(|a, b| {
            let a_ts = a.last_message.as_ref().map(|m| m.timestamp);
            let b_ts = b.last_message.as_ref().map(|m| m.timestamp);
            b_ts.cmp(&a_ts).then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    pub fn unread_count(&self, conversation_id: &str) -> u32 {
        self.conversations
            .get(conversation_id)
            .map_or(0, |c| c.unread_count)
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.values().map(|c| c.unread_count).sum()
    }

    /// Messages of a conversation ordered by timestamp
    pub fn messages(&self, conversation_id: &str) -> Vec<&Message> {
        self.sequences
            .get(conversation_id)
            .map(MessageSequence::ordered)
            .unwrap_or_default()
    }

    pub fn grouped_by_date<Tz: TimeZone>(&self, conversation_id: &str, tz: &Tz) -> Vec<DateGroup<'_>> {
        group_by_date(self.messages(conversation_id), tz)
    }

    fn is_selected(&self, conversation_id: &str) -> bool {
        self.selected.as_deref() == Some(conversation_id)
    }

    /// Locate the provisional message an inbound echo confirms
    fn find_own_provisional(&self, message: &Message) -> Option<usize> {
        let sequence = self.sequences.get(&message.conversation_id)?;
        if let Some(idx) = message.client_key.and_then(|key| sequence.find_provisional(key)) {
            return Some(idx);
        }
        if self.echo.heuristic && message.sender_id == self.me.id {
            return sequence.find_echo_candidate(message, self.echo.window);
        }
        None
    }

    fn confirm_provisional(&mut self, idx: usize, confirmed: &Message) {
        let Some(sequence) = self.sequences.get_mut(&confirmed.conversation_id) else {
            return;
        };
        let Some(promoted) = sequence.confirm(idx, confirmed).cloned() else {
            return;
        };
        if let Some(conversation) = self.conversations.get_mut(&confirmed.conversation_id) {
            let preview_is_provisional = conversation
                .last_message
                .as_ref()
                .map_or(false, |last| last.is_provisional() && last.client_key == promoted.client_key);
            if preview_is_provisional {
                conversation.last_message = Some(promoted);
            } else {
                conversation.offer_last_message(&promoted);
            }
        }
    }

    /// Create a shell conversation the first time a message arrives for it
    fn ensure_conversation(&mut self, message: &Message) -> ChatResult<()> {
        if self.conversations.contains_key(&message.conversation_id) {
            return Ok(());
        }
        let counterpart = if message.sender_id != self.me.id {
            Some(message.sender_id.as_str())
        } else {
            message.recipient_id.as_deref()
        };
        let Some(counterpart) = counterpart else {
            return Err(ChatError::Reconciliation {
                conversation_id: message.conversation_id.clone(),
                detail: "cannot infer counterpart for unknown conversation".into(),
            });
        };
        debug!(conversation = %message.conversation_id, counterpart, "creating conversation shell");
        self.conversations.insert(
            message.conversation_id.clone(),
            Conversation::new(
                message.conversation_id.clone(),
                Participants::from_pair(&self.me, counterpart),
            ),
        );
        Ok(())
    }
}
