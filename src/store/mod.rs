mod memory;

pub use memory::InMemoryMessageStore;

use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use crate::models::chat::{ ChatMessage, MessageStatus };
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message '{message_id}' already exists in conversation '{conversation_id}'")]
    DuplicateId {
        conversation_id: String,
        message_id: String,
    },
}

/// Ordered per-conversation message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_message(
        &self,
        conversation_id: &str,
        message: ChatMessage
    ) -> Result<(), StoreError>;

    /// All messages of the conversation, ascending by `created_at`; ties keep insertion order.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError>;

    async fn get_message(
        &self,
        conversation_id: &str,
        message_id: &str
    ) -> Result<Option<ChatMessage>, StoreError>;

    /// Advances the status of one message. Returns the updated message, or
    /// `None` when it is absent or already at (or past) `status`.
    async fn update_message_status(
        &self,
        conversation_id: &str,
        message_id: &str,
        status: MessageStatus,
        at: DateTime<Utc>
    ) -> Result<Option<ChatMessage>, StoreError>;
}
