//! Conversation and message repository with sliding-window history

use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

/// A persisted conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub client_id: Option<String>,
    pub title: Option<String>,
    pub knowledge_id: Option<String>,
    pub provider: String,
    pub model_name: String,
    pub temperature: f32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_archived: bool,
}

/// A persisted message; `message_index` is dense and zero-based per
/// conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub token_count: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub message_index: i64,
}

/// Marker the orchestrator embeds in the first system message so downstream
/// components can recover the conversation id without threading it
pub fn conversation_marker(conversation_id: &str) -> String {
    format!("[conversation:{conversation_id}]")
}

/// Repository over `conversations` and `messages`
#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        provider: &str,
        model: &str,
        knowledge_id: Option<&str>,
        temperature: f32,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO conversations
                (id, knowledge_id, provider, model_name, temperature, created_at, updated_at, is_archived)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0)
            "#,
        )
        .bind(&id)
        .bind(knowledge_id)
        .bind(provider)
        .bind(model)
        .bind(temperature)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(conversation_id = %id, provider, "Created conversation");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| read_conversation(&row)).transpose()
    }

    pub async fn require(&self, id: &str) -> Result<Conversation> {
        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("conversation {id}")))
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE is_archived = 0 ORDER BY updated_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(read_conversation).collect()
    }

    pub async fn update_title(&self, id: &str, title: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(title)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the provider/model used for the most recent turn.
    pub async fn update_provider(&self, id: &str, provider: &str, model: &str) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET provider = ?1, model_name = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(provider)
        .bind(model)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a conversation; messages cascade.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }

    /// Append a message; the index is assigned server-side as max+1 inside a
    /// transaction so concurrent appends never produce gaps or duplicates.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        token_count: Option<i64>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(message_index) + 1, 0) AS next FROM messages WHERE conversation_id = ?1",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await?;
        let next: i64 = row.get("next");

        sqlx::query(
            r#"
            INSERT INTO messages (conversation_id, role, content, token_count, timestamp, message_index)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(token_count)
        .bind(Utc::now().to_rfc3339())
        .bind(next)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(next)
    }

    /// Ensure the conversation's first system message carries the id marker.
    pub async fn attach_system_marker(&self, conversation_id: &str) -> Result<()> {
        let marker = conversation_marker(conversation_id);

        let row = sqlx::query(
            "SELECT id, content FROM messages WHERE conversation_id = ?1 AND role = 'system' ORDER BY message_index ASC LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let content: String = row.get("content");
                if !content.contains(&marker) {
                    let id: i64 = row.get("id");
                    sqlx::query("UPDATE messages SET content = ?1 WHERE id = ?2")
                        .bind(format!("{content}\n{marker}"))
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
            }
            None => {
                self.append_message(conversation_id, "system", &marker, None)
                    .await?;
            }
        }

        Ok(())
    }

    /// All messages for a conversation, in index order.
    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY message_index ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(read_message).collect()
    }

    /// The sliding window sent to providers: the most recent system message
    /// (injected at position 0) plus the last `max_turns` user/assistant
    /// pairs. Never more than `max_turns * 2 + 1` messages.
    pub async fn load_history(
        &self,
        conversation_id: &str,
        max_turns: usize,
    ) -> Result<Vec<StoredMessage>> {
        let all = self.messages(conversation_id).await?;

        let system = all.iter().rev().find(|m| m.role == "system").cloned();
        let mut window: Vec<StoredMessage> = all
            .into_iter()
            .filter(|m| m.role != "system")
            .collect();

        let keep = max_turns * 2;
        if window.len() > keep {
            window.drain(..window.len() - keep);
        }

        let mut history = Vec::with_capacity(window.len() + 1);
        if let Some(system) = system {
            history.push(system);
        }
        history.extend(window);
        Ok(history)
    }
}

fn read_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation> {
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let is_archived: i64 = row.get("is_archived");

    Ok(Conversation {
        id: row.get("id"),
        client_id: row.get("client_id"),
        title: row.get("title"),
        knowledge_id: row.get("knowledge_id"),
        provider: row.get("provider"),
        model_name: row.get("model_name"),
        temperature: row.get("temperature"),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        is_archived: is_archived != 0,
    })
}

fn read_message(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
    let timestamp: String = row.get("timestamp");

    Ok(StoredMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: row.get("role"),
        content: row.get("content"),
        token_count: row.get("token_count"),
        timestamp: parse_timestamp(&timestamp)?,
        message_index: row.get("message_index"),
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Config(format!("Corrupt timestamp in metadata store: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn store() -> ConversationStore {
        Database::open_in_memory("pass").await.unwrap().conversations()
    }

    #[tokio::test]
    async fn test_message_indices_are_dense() {
        let store = store().await;
        let id = store.create("Ollama", "llama3.2", None, 0.7).await.unwrap();

        assert_eq!(store.append_message(&id, "system", "s", None).await.unwrap(), 0);
        assert_eq!(store.append_message(&id, "user", "q1", None).await.unwrap(), 1);
        assert_eq!(store.append_message(&id, "assistant", "a1", None).await.unwrap(), 2);
        assert_eq!(store.append_message(&id, "user", "q2", None).await.unwrap(), 3);
        assert_eq!(store.append_message(&id, "assistant", "a2", None).await.unwrap(), 4);

        let messages = store.messages(&id).await.unwrap();
        let indices: Vec<i64> = messages.iter().map(|m| m.message_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_sliding_window_cap() {
        let store = store().await;
        let id = store.create("OpenAi", "gpt-4o", None, 0.7).await.unwrap();

        store.append_message(&id, "system", "sys", None).await.unwrap();
        for i in 0..5 {
            store
                .append_message(&id, "user", &format!("q{i}"), None)
                .await
                .unwrap();
            store
                .append_message(&id, "assistant", &format!("a{i}"), None)
                .await
                .unwrap();
        }

        let history = store.load_history(&id, 3).await.unwrap();
        // 3 user + 3 assistant + 1 system
        assert_eq!(history.len(), 7);
        assert_eq!(history[0].role, "system");
        assert_eq!(history[1].content, "q2");
        assert_eq!(history.last().unwrap().content, "a4");
    }

    #[tokio::test]
    async fn test_history_without_system_message() {
        let store = store().await;
        let id = store.create("Ollama", "llama3.2", None, 0.7).await.unwrap();
        store.append_message(&id, "user", "hello", None).await.unwrap();

        let history = store.load_history(&id, 3).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "user");
    }

    #[tokio::test]
    async fn test_system_marker_attach_is_idempotent() {
        let store = store().await;
        let id = store.create("Ollama", "llama3.2", None, 0.7).await.unwrap();
        store.append_message(&id, "system", "base prompt", None).await.unwrap();

        store.attach_system_marker(&id).await.unwrap();
        store.attach_system_marker(&id).await.unwrap();

        let messages = store.messages(&id).await.unwrap();
        let marker = conversation_marker(&id);
        assert_eq!(messages[0].content.matches(&marker).count(), 1);
    }

    #[tokio::test]
    async fn test_delete_cascades_messages() {
        let db = Database::open_in_memory("pass").await.unwrap();
        let store = db.conversations();
        let id = store.create("Google", "gemini-2.0-flash", None, 0.5).await.unwrap();
        store.append_message(&id, "user", "hi", None).await.unwrap();

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());

        let orphans = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE conversation_id = ?1")
            .bind(&id)
            .fetch_one(db.pool())
            .await
            .unwrap();
        let n: i64 = orphans.get("n");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = store().await;
        let err = store.delete("missing").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }
}
