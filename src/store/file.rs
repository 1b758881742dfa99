//! JSON snapshot store
//!
//! Keeps the tables in memory and rewrites the whole snapshot after each
//! mutation. Writes go to a sibling temp file first and are renamed into
//! place so a crash never leaves a half-written snapshot behind.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{ChatSession, ChatStore, DbMessage, Tables, Visibility};

pub struct FileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl FileStore {
    /// Open (or create) a snapshot at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tables = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Tables::default(),
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse chat store {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, tables: &Tables) -> Result<()> {
        let content = serde_json::to_vec_pretty(tables)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for FileStore {
    async fn save_chat(&self, chat: &ChatSession) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.save_chat(chat) {
            self.persist(&tables).await?;
        }
        Ok(())
    }

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<ChatSession>> {
        Ok(self.tables.lock().await.get_chat(id))
    }

    async fn delete_chat_by_id(&self, id: &str) -> Result<Option<ChatSession>> {
        let mut tables = self.tables.lock().await;
        let removed = tables.delete_chat(id);
        if removed.is_some() {
            self.persist(&tables).await?;
        }
        Ok(removed)
    }

    async fn update_chat_visibility(&self, id: &str, visibility: Visibility) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let updated = tables.set_visibility(id, visibility);
        if updated {
            self.persist(&tables).await?;
        }
        Ok(updated)
    }

    async fn save_messages(&self, messages: &[DbMessage]) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.save_messages(messages) > 0 {
            self.persist(&tables).await?;
        }
        Ok(())
    }

    async fn get_messages_by_chat(&self, chat_id: &str) -> Result<Vec<DbMessage>> {
        Ok(self.tables.lock().await.messages_by_chat(chat_id))
    }

    async fn get_message_count_by_user(&self, user_id: &str, window: Duration) -> Result<usize> {
        let since = Utc::now() - window;
        Ok(self
            .tables
            .lock()
            .await
            .message_count_by_user(user_id, since))
    }

    async fn create_stream_id(&self, stream_id: &str, chat_id: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.create_stream(stream_id, chat_id) {
            self.persist(&tables).await?;
        }
        Ok(())
    }

    async fn get_stream_ids_by_chat(&self, chat_id: &str) -> Result<Vec<String>> {
        Ok(self.tables.lock().await.stream_ids_by_chat(chat_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageRole;
    use crate::store::test_support::{chat, exercise, message};

    #[tokio::test]
    async fn file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("chats.json")).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chats.json");

        {
            let store = FileStore::open(&path).await.unwrap();
            store.save_chat(&chat("c1", "alice")).await.unwrap();
            store
                .save_messages(&[message("m1", "c1", MessageRole::User, "persist me")])
                .await
                .unwrap();
            store.create_stream_id("s1", "c1").await.unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.path(), path.as_path());
        let messages = reopened.get_messages_by_chat("c1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "persist me");
        assert_eq!(
            reopened.get_stream_ids_by_chat("c1").await.unwrap(),
            vec!["s1".to_string()]
        );
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chats.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(FileStore::open(&path).await.is_err());
    }
}
