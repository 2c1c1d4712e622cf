//! Persistent recovery snapshot for agent status, adapted from the
//! teacher's `agent_storage.rs` `AgentStorage` trait shape: an async trait
//! over `DatabaseConnection`, backed by migration-created tables rather
//! than ad hoc `CREATE TABLE IF NOT EXISTS` statements.

use async_trait::async_trait;
use sqlx::Row;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::database::{DatabaseConnection, DatabaseError, DatabaseResult, StorageError};
use crate::domain_types::{AgentCategory, AgentId, AgentStatus};

/// A point-in-time snapshot of one agent's status, as persisted for
/// crash recovery (the live source of truth is `registry::AgentRegistry`).
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStatusRecord {
    /// Agent id.
    pub agent_id: AgentId,
    /// Operational category.
    pub category: AgentCategory,
    /// Display name.
    pub name: String,
    /// Status at snapshot time.
    pub status: AgentStatus,
    /// Last heartbeat observed, if any.
    pub last_seen: Option<SystemTime>,
    /// Arbitrary metadata blob.
    pub metadata: serde_json::Value,
}

/// Persistent storage interface for agent status recovery snapshots.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Inserts or replaces the snapshot for one agent.
    async fn upsert(&self, record: &AgentStatusRecord) -> DatabaseResult<()>;
    /// Loads every persisted snapshot, for registry warm-start on boot.
    async fn load_all(&self) -> DatabaseResult<Vec<AgentStatusRecord>>;
    /// Removes a persisted snapshot.
    async fn remove(&self, agent_id: AgentId) -> DatabaseResult<()>;
}

/// `SQLite`-backed `AgentStore`.
pub struct SqliteAgentStore {
    connection: DatabaseConnection,
}

impl SqliteAgentStore {
    /// Wraps an initialized connection.
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }
}

fn category_to_str(category: AgentCategory) -> &'static str {
    match category {
        AgentCategory::Market => "market",
        AgentCategory::Executive => "executive",
        AgentCategory::Content => "content",
        AgentCategory::Logistics => "logistics",
        AgentCategory::System => "system",
        AgentCategory::Specialist => "specialist",
        AgentCategory::Utility => "utility",
        AgentCategory::Mobile => "mobile",
    }
}

fn category_from_str(s: &str) -> AgentCategory {
    match s {
        "executive" => AgentCategory::Executive,
        "content" => AgentCategory::Content,
        "logistics" => AgentCategory::Logistics,
        "system" => AgentCategory::System,
        "specialist" => AgentCategory::Specialist,
        "utility" => AgentCategory::Utility,
        "mobile" => AgentCategory::Mobile,
        _ => AgentCategory::Market,
    }
}

fn status_to_str(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Unknown => "unknown",
        AgentStatus::Registering => "registering",
        AgentStatus::Active => "active",
        AgentStatus::Busy => "busy",
        AgentStatus::Inactive => "inactive",
        AgentStatus::Disconnected => "disconnected",
        AgentStatus::Error => "error",
    }
}

fn status_from_str(s: &str) -> AgentStatus {
    match s {
        "registering" => AgentStatus::Registering,
        "active" => AgentStatus::Active,
        "busy" => AgentStatus::Busy,
        "inactive" => AgentStatus::Inactive,
        "disconnected" => AgentStatus::Disconnected,
        "error" => AgentStatus::Error,
        _ => AgentStatus::Unknown,
    }
}

#[async_trait]
impl AgentStore for SqliteAgentStore {
    async fn upsert(&self, record: &AgentStatusRecord) -> DatabaseResult<()> {
        let last_seen_ms = record
            .last_seen
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));

        sqlx::query(
            "INSERT INTO agent_status (agent_id, category, name, status, last_seen_unix_ms, metadata)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET category = excluded.category, name = excluded.name,
             status = excluded.status, last_seen_unix_ms = excluded.last_seen_unix_ms, metadata = excluded.metadata",
        )
        .bind(record.agent_id.to_string())
        .bind(category_to_str(record.category))
        .bind(&record.name)
        .bind(status_to_str(record.status))
        .bind(last_seen_ms)
        .bind(record.metadata.to_string())
        .execute(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;
        Ok(())
    }

    async fn load_all(&self) -> DatabaseResult<Vec<AgentStatusRecord>> {
        let rows = sqlx::query("SELECT agent_id, category, name, status, last_seen_unix_ms, metadata FROM agent_status")
            .fetch_all(self.connection.pool())
            .await
            .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let agent_id_str: String = row.get("agent_id");
            let Ok(agent_id) = agent_id_str.parse::<uuid::Uuid>() else { continue };
            let last_seen_ms: Option<i64> = row.get("last_seen_unix_ms");
            let metadata_str: String = row.get("metadata");
            let Ok(agent_id) = AgentId::try_from(agent_id);
            records.push(AgentStatusRecord {
                agent_id,
                category: category_from_str(&row.get::<String, _>("category")),
                name: row.get("name"),
                status: status_from_str(&row.get::<String, _>("status")),
                last_seen: last_seen_ms.map(|ms| UNIX_EPOCH + std::time::Duration::from_millis(ms as u64)),
                metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
            });
        }
        Ok(records)
    }

    async fn remove(&self, agent_id: AgentId) -> DatabaseResult<()> {
        sqlx::query("DELETE FROM agent_status WHERE agent_id = ?")
            .bind(agent_id.to_string())
            .execute(self.connection.pool())
            .await
            .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;
        Ok(())
    }
}
