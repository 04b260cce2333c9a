//! REST collaborator seams
//!
//! Persistence of conversations, messages and notifications belongs to the
//! backend. The session talks to it through these traits; the embedding
//! application provides the HTTP implementation.

use async_trait::async_trait;

use crate::error::ChatResult;
use crate::store::ReadReceipt;
use crate::types::{Conversation, Message, NotificationPage};

#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// One page of the identity's conversations, most recent first
    async fn fetch_conversations(&self, page: u32, limit: u32) -> ChatResult<Vec<Conversation>>;

    /// One page of a conversation's history
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        page: u32,
        limit: u32,
    ) -> ChatResult<Vec<Message>>;

    async fn mark_conversation_read(&self, receipt: &ReadReceipt) -> ChatResult<()>;
}

#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// `{page, limit}` → `{data, total, unReadTotal}`
    async fn fetch_notifications(&self, page: u32, limit: u32) -> ChatResult<NotificationPage>;

    async fn mark_all_read(&self) -> ChatResult<()>;

    async fn mark_read(&self, notification_id: &str) -> ChatResult<()>;

    async fn clear(&self) -> ChatResult<()>;
}
