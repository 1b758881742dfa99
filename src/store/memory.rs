//! In-memory implementation of ChatStore
//!
//! Used for tests and as the default when no file path is configured.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use super::{ChatSession, ChatStore, DbMessage, Tables, Visibility};

/// In-memory store backed by a RwLock over plain tables
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn save_chat(&self, chat: &ChatSession) -> Result<()> {
        self.tables.write().await.save_chat(chat);
        Ok(())
    }

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<ChatSession>> {
        Ok(self.tables.read().await.get_chat(id))
    }

    async fn delete_chat_by_id(&self, id: &str) -> Result<Option<ChatSession>> {
        Ok(self.tables.write().await.delete_chat(id))
    }

    async fn update_chat_visibility(&self, id: &str, visibility: Visibility) -> Result<bool> {
        Ok(self.tables.write().await.set_visibility(id, visibility))
    }

    async fn save_messages(&self, messages: &[DbMessage]) -> Result<()> {
        self.tables.write().await.save_messages(messages);
        Ok(())
    }

    async fn get_messages_by_chat(&self, chat_id: &str) -> Result<Vec<DbMessage>> {
        Ok(self.tables.read().await.messages_by_chat(chat_id))
    }

    async fn get_message_count_by_user(&self, user_id: &str, window: Duration) -> Result<usize> {
        let since = Utc::now() - window;
        Ok(self
            .tables
            .read()
            .await
            .message_count_by_user(user_id, since))
    }

    async fn create_stream_id(&self, stream_id: &str, chat_id: &str) -> Result<()> {
        self.tables.write().await.create_stream(stream_id, chat_id);
        Ok(())
    }

    async fn get_stream_ids_by_chat(&self, chat_id: &str) -> Result<Vec<String>> {
        Ok(self.tables.read().await.stream_ids_by_chat(chat_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageRole;
    use crate::store::test_support::{chat, exercise, message};

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn old_messages_fall_outside_the_window() {
        let store = MemoryStore::new();
        store.save_chat(&chat("c1", "alice")).await.unwrap();
        let mut old = message("m-old", "c1", MessageRole::User, "yesterday");
        old.created_at = Utc::now() - Duration::hours(30);
        let fresh = message("m-new", "c1", MessageRole::User, "today");
        let reply = message("m-reply", "c1", MessageRole::Assistant, "sure");
        store.save_messages(&[old, fresh, reply]).await.unwrap();

        let count = store
            .get_message_count_by_user("alice", Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
