use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::chat::{ ChatMessage, MessageStatus };
use super::{ MessageStore, StoreError };

/// Process-local store. Contents live as long as the process does.
#[derive(Default)]
pub struct InMemoryMessageStore {
    conversations: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.read().expect("message store lock poisoned").len()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append_message(
        &self,
        conversation_id: &str,
        message: ChatMessage
    ) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().expect("message store lock poisoned");
        let log = conversations.entry(conversation_id.to_string()).or_default();
        if log.iter().any(|m| m.id == message.id) {
            return Err(StoreError::DuplicateId {
                conversation_id: conversation_id.to_string(),
                message_id: message.id,
            });
        }
        log.push(message);
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let conversations = self.conversations.read().expect("message store lock poisoned");
        let mut messages = conversations.get(conversation_id).cloned().unwrap_or_default();
        // stable sort keeps insertion order for equal timestamps
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn get_message(
        &self,
        conversation_id: &str,
        message_id: &str
    ) -> Result<Option<ChatMessage>, StoreError> {
        let conversations = self.conversations.read().expect("message store lock poisoned");
        Ok(
            conversations
                .get(conversation_id)
                .and_then(|log| log.iter().find(|m| m.id == message_id))
                .cloned()
        )
    }

    async fn update_message_status(
        &self,
        conversation_id: &str,
        message_id: &str,
        status: MessageStatus,
        at: DateTime<Utc>
    ) -> Result<Option<ChatMessage>, StoreError> {
        let mut conversations = self.conversations.write().expect("message store lock poisoned");
        let message = conversations
            .get_mut(conversation_id)
            .and_then(|log| log.iter_mut().find(|m| m.id == message_id));

        match message {
            Some(message) => {
                if message.advance_status(status, at) { Ok(Some(message.clone())) } else { Ok(None) }
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{ MessageKind, Participant };
    use chrono::Duration;

    fn message(body: &str, created_at: DateTime<Utc>) -> ChatMessage {
        let sender = Participant::new("u1", "Ada", "#111");
        ChatMessage::sent_by("c1", &sender, body, MessageKind::Text, None, created_at)
    }

    #[tokio::test]
    async fn lists_by_created_at_with_insertion_tiebreak() {
        let store = InMemoryMessageStore::new();
        let t0 = Utc::now();

        store.append_message("c1", message("late", t0 + Duration::seconds(5))).await.unwrap();
        store.append_message("c1", message("first-tie", t0)).await.unwrap();
        store.append_message("c1", message("second-tie", t0)).await.unwrap();

        let bodies: Vec<String> = store
            .list_messages("c1").await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["first-tie", "second-tie", "late"]);
        assert!(store.list_messages("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_duplicate_ids() {
        let store = InMemoryMessageStore::new();
        let m = message("gm", Utc::now());

        store.append_message("c1", m.clone()).await.unwrap();
        let err = store.append_message("c1", m).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { .. }));
        assert_eq!(store.list_messages("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_updates_only_move_forward() {
        let store = InMemoryMessageStore::new();
        let m = message("gm", Utc::now());
        let id = m.id.clone();
        store.append_message("c1", m).await.unwrap();

        let updated = store
            .update_message_status("c1", &id, MessageStatus::Read, Utc::now()).await
            .unwrap()
            .expect("first read applies");
        assert_eq!(updated.status, MessageStatus::Read);

        let again = store.update_message_status("c1", &id, MessageStatus::Read, Utc::now()).await;
        assert!(again.unwrap().is_none());

        let missing = store.update_message_status("c1", "nope", MessageStatus::Read, Utc::now()).await;
        assert!(missing.unwrap().is_none());
        assert_eq!(store.conversation_count(), 1);
    }
}
