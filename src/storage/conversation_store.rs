//! Conversation and message persistence for the chat orchestrator.
//!
//! Adapted from the teacher's `conversation_storage.rs`/`message_storage.rs`
//! pair: one table per concept, foreign-keyed, created by migration rather
//! than `CREATE TABLE IF NOT EXISTS` at call time.

use async_trait::async_trait;
use sqlx::Row;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use crate::database::{DatabaseConnection, DatabaseError, DatabaseResult, StorageError};
use crate::domain_types::AgentId;

/// Who authored a stored chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageRole {
    /// The end user.
    User,
    /// A coordinated agent.
    Agent,
    /// The orchestrator itself (acknowledgements, system notices).
    System,
}

impl MessageRole {
    fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "agent" => Self::Agent,
            "system" => Self::System,
            _ => Self::User,
        }
    }
}

/// One persisted chat turn.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Unique id.
    pub message_id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Author role.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
    /// Routing/intent metadata (intent, confidence, handoff flag, etc.).
    pub metadata: serde_json::Value,
    /// Wall-clock creation time.
    pub created_at: SystemTime,
}

/// A conversation's durable state.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    /// Unique id.
    pub conversation_id: String,
    /// Owning user.
    pub user_id: String,
    /// Display title.
    pub title: String,
    /// Currently assigned agent, if a handoff has occurred.
    pub assigned_agent_id: Option<AgentId>,
    /// Creation time.
    pub created_at: SystemTime,
    /// Last activity time, used to resolve the `main` sentinel.
    pub last_activity: SystemTime,
}

/// Persistence interface for conversations and their messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates a conversation if it doesn't already exist; no-op otherwise.
    async fn ensure_conversation(&self, conversation_id: &str, user_id: &str, title: &str) -> DatabaseResult<()>;
    /// Fetches one conversation's record.
    async fn get_conversation(&self, conversation_id: &str) -> DatabaseResult<Option<ConversationRecord>>;
    /// The most recently active conversation id for a user, if any.
    async fn latest_conversation_for_user(&self, user_id: &str) -> DatabaseResult<Option<String>>;
    /// Updates the agent currently assigned to handle a conversation.
    async fn set_assigned_agent(&self, conversation_id: &str, agent_id: AgentId) -> DatabaseResult<()>;
    /// Appends one message and bumps the conversation's last-activity time.
    async fn append_message(&self, message: &StoredMessage) -> DatabaseResult<()>;
    /// The most recent `limit` messages for a conversation, oldest first.
    /// Strictly filters to `conversation_id`: any row with a mismatched id
    /// found during the scan is dropped and logged as a contamination error
    /// rather than returned.
    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> DatabaseResult<Vec<StoredMessage>>;
}

/// `SQLite`-backed `ConversationStore`.
pub struct SqliteConversationStore {
    connection: DatabaseConnection,
}

impl SqliteConversationStore {
    /// Wraps an initialized connection.
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }
}

fn to_unix_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX)).unwrap_or(0)
}

fn from_unix_ms(ms: i64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn ensure_conversation(&self, conversation_id: &str, user_id: &str, title: &str) -> DatabaseResult<()> {
        let now = to_unix_ms(SystemTime::now());
        sqlx::query(
            "INSERT OR IGNORE INTO conversations (conversation_id, user_id, title, assigned_agent_id, created_at_unix_ms, last_activity_unix_ms)
             VALUES (?, ?, ?, NULL, ?, ?)",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> DatabaseResult<Option<ConversationRecord>> {
        let row = sqlx::query(
            "SELECT conversation_id, user_id, title, assigned_agent_id, created_at_unix_ms, last_activity_unix_ms
             FROM conversations WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;

        Ok(row.map(|row| ConversationRecord {
            conversation_id: row.get("conversation_id"),
            user_id: row.get("user_id"),
            title: row.get("title"),
            assigned_agent_id: row
                .get::<Option<String>, _>("assigned_agent_id")
                .and_then(|s| s.parse::<uuid::Uuid>().ok())
                .and_then(|u| AgentId::try_from(u).ok()),
            created_at: from_unix_ms(row.get("created_at_unix_ms")),
            last_activity: from_unix_ms(row.get("last_activity_unix_ms")),
        }))
    }

    async fn latest_conversation_for_user(&self, user_id: &str) -> DatabaseResult<Option<String>> {
        let row = sqlx::query(
            "SELECT conversation_id FROM conversations WHERE user_id = ? ORDER BY last_activity_unix_ms DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;
        Ok(row.map(|row| row.get("conversation_id")))
    }

    async fn set_assigned_agent(&self, conversation_id: &str, agent_id: AgentId) -> DatabaseResult<()> {
        sqlx::query("UPDATE conversations SET assigned_agent_id = ? WHERE conversation_id = ?")
            .bind(agent_id.to_string())
            .bind(conversation_id)
            .execute(self.connection.pool())
            .await
            .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;
        Ok(())
    }

    async fn append_message(&self, message: &StoredMessage) -> DatabaseResult<()> {
        let created_at = to_unix_ms(message.created_at);
        sqlx::query(
            "INSERT INTO conversation_messages (message_id, conversation_id, role, content, metadata, created_at_unix_ms)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.message_id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.metadata.to_string())
        .bind(created_at)
        .execute(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;

        sqlx::query("UPDATE conversations SET last_activity_unix_ms = ? WHERE conversation_id = ?")
            .bind(created_at)
            .bind(&message.conversation_id)
            .execute(self.connection.pool())
            .await
            .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;
        Ok(())
    }

    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> DatabaseResult<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT message_id, conversation_id, role, content, metadata, created_at_unix_ms
             FROM conversation_messages WHERE conversation_id = ? ORDER BY created_at_unix_ms DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let row_conversation_id: String = row.get("conversation_id");
            if row_conversation_id != conversation_id {
                tracing::error!(expected = conversation_id, got = %row_conversation_id, "conversation contamination detected, dropping row");
                continue;
            }
            let metadata_str: String = row.get("metadata");
            messages.push(StoredMessage {
                message_id: row.get("message_id"),
                conversation_id: row_conversation_id,
                role: MessageRole::from_str(&row.get::<String, _>("role")),
                content: row.get("content"),
                metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
                created_at: from_unix_ms(row.get("created_at_unix_ms")),
            });
        }
        messages.reverse();
        Ok(messages)
    }
}

/// In-memory `ConversationStore` used by orchestrator unit tests so intent
/// routing logic can be exercised without a real database.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<String, ConversationRecord>>,
    messages: Mutex<Vec<StoredMessage>>,
}

impl InMemoryConversationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn ensure_conversation(&self, conversation_id: &str, user_id: &str, title: &str) -> DatabaseResult<()> {
        let mut conversations = self.conversations.lock().await;
        conversations.entry(conversation_id.to_string()).or_insert_with(|| ConversationRecord {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            assigned_agent_id: None,
            created_at: SystemTime::now(),
            last_activity: SystemTime::now(),
        });
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> DatabaseResult<Option<ConversationRecord>> {
        Ok(self.conversations.lock().await.get(conversation_id).cloned())
    }

    async fn latest_conversation_for_user(&self, user_id: &str) -> DatabaseResult<Option<String>> {
        let conversations = self.conversations.lock().await;
        Ok(conversations
            .values()
            .filter(|c| c.user_id == user_id)
            .max_by_key(|c| c.last_activity)
            .map(|c| c.conversation_id.clone()))
    }

    async fn set_assigned_agent(&self, conversation_id: &str, agent_id: AgentId) -> DatabaseResult<()> {
        if let Some(record) = self.conversations.lock().await.get_mut(conversation_id) {
            record.assigned_agent_id = Some(agent_id);
        }
        Ok(())
    }

    async fn append_message(&self, message: &StoredMessage) -> DatabaseResult<()> {
        if let Some(record) = self.conversations.lock().await.get_mut(&message.conversation_id) {
            record.last_activity = message.created_at;
        }
        self.messages.lock().await.push(message.clone());
        Ok(())
    }

    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> DatabaseResult<Vec<StoredMessage>> {
        let messages = self.messages.lock().await;
        let mut filtered: Vec<StoredMessage> = messages.iter().filter(|m| m.conversation_id == conversation_id).cloned().collect();
        if filtered.len() > limit {
            filtered = filtered.split_off(filtered.len() - limit);
        }
        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_never_returns_another_conversations_messages() {
        let store = InMemoryConversationStore::new();
        store.ensure_conversation("c1", "u1", "C1").await.unwrap();
        store.ensure_conversation("c2", "u1", "C2").await.unwrap();
        store
            .append_message(&StoredMessage {
                message_id: "m1".into(),
                conversation_id: "c1".into(),
                role: MessageRole::User,
                content: "hello c1".into(),
                metadata: serde_json::json!({}),
                created_at: SystemTime::now(),
            })
            .await
            .unwrap();
        store
            .append_message(&StoredMessage {
                message_id: "m2".into(),
                conversation_id: "c2".into(),
                role: MessageRole::User,
                content: "hello c2".into(),
                metadata: serde_json::json!({}),
                created_at: SystemTime::now(),
            })
            .await
            .unwrap();

        let c1_messages = store.recent_messages("c1", 10).await.unwrap();
        assert_eq!(c1_messages.len(), 1);
        assert_eq!(c1_messages[0].content, "hello c1");
    }

    #[tokio::test]
    async fn main_sentinel_resolves_to_most_recently_active_conversation() {
        let store = InMemoryConversationStore::new();
        store.ensure_conversation("c1", "u1", "C1").await.unwrap();
        store.ensure_conversation("c2", "u1", "C2").await.unwrap();
        store
            .append_message(&StoredMessage {
                message_id: "m1".into(),
                conversation_id: "c2".into(),
                role: MessageRole::User,
                content: "latest".into(),
                metadata: serde_json::json!({}),
                created_at: SystemTime::now(),
            })
            .await
            .unwrap();

        let latest = store.latest_conversation_for_user("u1").await.unwrap();
        assert_eq!(latest, Some("c2".to_string()));
    }
}
