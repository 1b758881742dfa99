//! Chat persistence boundary
//!
//! The generation pipeline only needs a handful of single-record operations
//! (save, lookup by id, list by chat, count by user), so the store is a small
//! async trait with two backends: an in-memory map for tests and local runs,
//! and a JSON snapshot file for single-node deployments.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// One content part of a stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    File {
        media_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInvocation {
        tool_call_id: String,
        tool_name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMessage {
    pub id: String,
    pub chat_id: String,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
    pub created_at: DateTime<Utc>,
}

impl DbMessage {
    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// One generation attempt's resumable stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub id: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
}

/// Abstraction over chat persistence.
///
/// Every call is atomic at the single-record level. Writes are idempotent by
/// id: saving a chat or message whose id already exists leaves the stored
/// record untouched.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn save_chat(&self, chat: &ChatSession) -> Result<()>;

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<ChatSession>>;

    /// Delete a chat together with its messages and stream records.
    async fn delete_chat_by_id(&self, id: &str) -> Result<Option<ChatSession>>;

    /// Returns `false` when the chat does not exist.
    async fn update_chat_visibility(&self, id: &str, visibility: Visibility) -> Result<bool>;

    async fn save_messages(&self, messages: &[DbMessage]) -> Result<()>;

    /// Messages of one chat in creation order.
    async fn get_messages_by_chat(&self, chat_id: &str) -> Result<Vec<DbMessage>>;

    /// User-role messages sent by `user_id` across all of their chats within
    /// the trailing `window`.
    async fn get_message_count_by_user(&self, user_id: &str, window: Duration) -> Result<usize>;

    async fn create_stream_id(&self, stream_id: &str, chat_id: &str) -> Result<()>;

    /// Stream ids of one chat, oldest first.
    async fn get_stream_ids_by_chat(&self, chat_id: &str) -> Result<Vec<String>>;
}

/// Open the backend selected in config.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn ChatStore>> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory chat store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::File => {
            let path = config.resolved_path()?;
            tracing::info!(path = %path.display(), "Using file-backed chat store");
            Ok(Arc::new(FileStore::open(path).await?))
        }
    }
}

/// Table state shared by both backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Tables {
    #[serde(default)]
    chats: HashMap<String, ChatSession>,
    #[serde(default)]
    messages: Vec<DbMessage>,
    #[serde(default)]
    streams: Vec<StreamRecord>,
}

impl Tables {
    fn save_chat(&mut self, chat: &ChatSession) -> bool {
        if self.chats.contains_key(&chat.id) {
            return false;
        }
        self.chats.insert(chat.id.clone(), chat.clone());
        true
    }

    fn get_chat(&self, id: &str) -> Option<ChatSession> {
        self.chats.get(id).cloned()
    }

    fn delete_chat(&mut self, id: &str) -> Option<ChatSession> {
        let removed = self.chats.remove(id)?;
        self.messages.retain(|m| m.chat_id != id);
        self.streams.retain(|s| s.chat_id != id);
        Some(removed)
    }

    fn set_visibility(&mut self, id: &str, visibility: Visibility) -> bool {
        match self.chats.get_mut(id) {
            Some(chat) => {
                chat.visibility = visibility;
                true
            }
            None => false,
        }
    }

    fn save_messages(&mut self, messages: &[DbMessage]) -> usize {
        let mut inserted = 0;
        for message in messages {
            if self.messages.iter().any(|m| m.id == message.id) {
                continue;
            }
            self.messages.push(message.clone());
            inserted += 1;
        }
        inserted
    }

    fn messages_by_chat(&self, chat_id: &str) -> Vec<DbMessage> {
        let mut messages: Vec<DbMessage> = self
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        // Stable: equal timestamps keep insertion order.
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    fn message_count_by_user(&self, user_id: &str, since: DateTime<Utc>) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::User && m.created_at >= since)
            .filter(|m| {
                self.chats
                    .get(&m.chat_id)
                    .is_some_and(|chat| chat.user_id == user_id)
            })
            .count()
    }

    fn create_stream(&mut self, stream_id: &str, chat_id: &str) -> bool {
        if self.streams.iter().any(|s| s.id == stream_id) {
            return false;
        }
        self.streams.push(StreamRecord {
            id: stream_id.to_string(),
            chat_id: chat_id.to_string(),
            created_at: Utc::now(),
        });
        true
    }

    fn stream_ids_by_chat(&self, chat_id: &str) -> Vec<String> {
        let mut streams: Vec<&StreamRecord> =
            self.streams.iter().filter(|s| s.chat_id == chat_id).collect();
        streams.sort_by_key(|s| s.created_at);
        streams.into_iter().map(|s| s.id.clone()).collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn chat(id: &str, user: &str) -> ChatSession {
        ChatSession {
            id: id.to_string(),
            user_id: user.to_string(),
            title: "test chat".to_string(),
            visibility: Visibility::Private,
            created_at: Utc::now(),
        }
    }

    pub fn message(id: &str, chat_id: &str, role: MessageRole, text: &str) -> DbMessage {
        DbMessage {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            role,
            parts: vec![MessagePart::Text {
                text: text.to_string(),
            }],
            created_at: Utc::now(),
        }
    }

    /// Behaviour every backend must share.
    pub async fn exercise(store: &dyn ChatStore) {
        store.save_chat(&chat("c1", "alice")).await.unwrap();
        store.save_chat(&chat("c2", "bob")).await.unwrap();

        // Re-saving does not overwrite.
        let mut renamed = chat("c1", "mallory");
        renamed.title = "changed".to_string();
        store.save_chat(&renamed).await.unwrap();
        let stored = store.get_chat_by_id("c1").await.unwrap().unwrap();
        assert_eq!(stored.user_id, "alice");

        let user = message("m1", "c1", MessageRole::User, "hi");
        let mut reply = message("m2", "c1", MessageRole::Assistant, "hello");
        reply.created_at = user.created_at + Duration::milliseconds(5);
        store.save_messages(&[reply.clone()]).await.unwrap();
        store.save_messages(&[user.clone()]).await.unwrap();
        store.save_messages(&[user.clone()]).await.unwrap();
        store
            .save_messages(&[message("m3", "c2", MessageRole::User, "yo")])
            .await
            .unwrap();

        let messages = store.get_messages_by_chat("c1").await.unwrap();
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);

        assert_eq!(
            store
                .get_message_count_by_user("alice", Duration::hours(24))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .get_message_count_by_user("bob", Duration::hours(24))
                .await
                .unwrap(),
            1
        );

        store.create_stream_id("s1", "c1").await.unwrap();
        store.create_stream_id("s2", "c1").await.unwrap();
        let streams = store.get_stream_ids_by_chat("c1").await.unwrap();
        assert_eq!(streams.last().map(String::as_str), Some("s2"));
        assert_eq!(streams.len(), 2);

        assert!(
            store
                .update_chat_visibility("c1", Visibility::Public)
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_chat_visibility("nope", Visibility::Public)
                .await
                .unwrap()
        );
        assert_eq!(
            store.get_chat_by_id("c1").await.unwrap().unwrap().visibility,
            Visibility::Public
        );

        let deleted = store.delete_chat_by_id("c1").await.unwrap();
        assert_eq!(deleted.map(|c| c.id), Some("c1".to_string()));
        assert!(store.get_chat_by_id("c1").await.unwrap().is_none());
        assert!(store.get_messages_by_chat("c1").await.unwrap().is_empty());
        assert!(store.get_stream_ids_by_chat("c1").await.unwrap().is_empty());
        assert!(store.delete_chat_by_id("c1").await.unwrap().is_none());
    }
}
