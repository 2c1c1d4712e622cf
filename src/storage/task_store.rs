//! Recovery snapshot persistence for the task delegator's in-memory state.

use async_trait::async_trait;
use sqlx::Row;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::database::{DatabaseConnection, DatabaseError, DatabaseResult, StorageError};
use crate::delegator::{Task, TaskStatus};
use crate::domain_types::{AgentId, Priority, TaskId};

/// A flattened, persistable view of one `delegator::Task`.
#[derive(Debug, Clone)]
pub struct PersistedTaskRecord {
    /// Task id.
    pub task_id: TaskId,
    /// Task type name.
    pub task_type: String,
    /// Parent task, if this is a subtask.
    pub parent_id: Option<TaskId>,
    /// Currently assigned agent, if any.
    pub assigned_agent_id: Option<AgentId>,
    /// Current status.
    pub status: TaskStatus,
    /// Priority.
    pub priority: Priority,
    /// Input parameters.
    pub parameters: serde_json::Value,
    /// Result payload, once completed.
    pub result: Option<serde_json::Value>,
    /// Error message, if failed.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: SystemTime,
    /// Last status-transition time.
    pub updated_at: SystemTime,
}

impl PersistedTaskRecord {
    /// Flattens a live `Task` into its persistable snapshot.
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            parent_id: task.parent_id,
            assigned_agent_id: task.assigned_agent,
            status: task.status,
            priority: task.priority,
            parameters: parameters_to_value(&task.parameters),
            result: task.result.clone(),
            error: task.error.clone(),
            created_at: task.created_at,
            updated_at: task.transitioned_at.last().map_or(task.created_at, |(_, at)| *at),
        }
    }
}

fn parameters_to_value(parameters: &std::collections::HashMap<String, serde_json::Value>) -> serde_json::Value {
    serde_json::to_value(parameters).unwrap_or(serde_json::json!({}))
}

fn status_to_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Created => "created",
        TaskStatus::Assigned => "assigned",
        TaskStatus::Accepted => "accepted",
        TaskStatus::Processing => "processing",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
        TaskStatus::Timeout => "timeout",
    }
}

fn status_from_str(s: &str) -> TaskStatus {
    match s {
        "assigned" => TaskStatus::Assigned,
        "accepted" => TaskStatus::Accepted,
        "processing" => TaskStatus::Processing,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        "timeout" => TaskStatus::Timeout,
        _ => TaskStatus::Created,
    }
}

fn priority_to_str(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Critical => "critical",
    }
}

fn priority_from_str(s: &str) -> Priority {
    match s {
        "low" => Priority::Low,
        "high" => Priority::High,
        "critical" => Priority::Critical,
        _ => Priority::Normal,
    }
}

fn to_unix_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX)).unwrap_or(0)
}

fn from_unix_ms(ms: i64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

/// Persistence interface for task recovery snapshots.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts or replaces a task's snapshot.
    async fn upsert(&self, record: &PersistedTaskRecord) -> DatabaseResult<()>;
    /// Loads every persisted non-terminal task, for delegator warm-start on boot.
    async fn load_active(&self) -> DatabaseResult<Vec<PersistedTaskRecord>>;
}

/// `SQLite`-backed `TaskStore`.
pub struct SqliteTaskStore {
    connection: DatabaseConnection,
}

impl SqliteTaskStore {
    /// Wraps an initialized connection.
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn upsert(&self, record: &PersistedTaskRecord) -> DatabaseResult<()> {
        sqlx::query(
            "INSERT INTO tasks (task_id, task_type, parent_id, assigned_agent_id, status, priority, parameters, result, error, created_at_unix_ms, updated_at_unix_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(task_id) DO UPDATE SET status = excluded.status, assigned_agent_id = excluded.assigned_agent_id,
             result = excluded.result, error = excluded.error, updated_at_unix_ms = excluded.updated_at_unix_ms",
        )
        .bind(record.task_id.to_string())
        .bind(&record.task_type)
        .bind(record.parent_id.map(|id| id.to_string()))
        .bind(record.assigned_agent_id.map(|id| id.to_string()))
        .bind(status_to_str(record.status))
        .bind(priority_to_str(record.priority))
        .bind(record.parameters.to_string())
        .bind(record.result.as_ref().map(std::string::ToString::to_string))
        .bind(&record.error)
        .bind(to_unix_ms(record.created_at))
        .bind(to_unix_ms(record.updated_at))
        .execute(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;
        Ok(())
    }

    async fn load_active(&self) -> DatabaseResult<Vec<PersistedTaskRecord>> {
        let rows = sqlx::query(
            "SELECT task_id, task_type, parent_id, assigned_agent_id, status, priority, parameters, result, error, created_at_unix_ms, updated_at_unix_ms
             FROM tasks WHERE status NOT IN ('completed', 'failed', 'cancelled', 'timeout')",
        )
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id_str: String = row.get("task_id");
            let Ok(task_id) = task_id_str.parse::<uuid::Uuid>().map_err(|_| ()).and_then(|u| TaskId::try_from(u).map_err(|_| ())) else {
                continue;
            };
            let parameters_str: String = row.get("parameters");
            let result_str: Option<String> = row.get("result");
            records.push(PersistedTaskRecord {
                task_id,
                task_type: row.get("task_type"),
                parent_id: row
                    .get::<Option<String>, _>("parent_id")
                    .and_then(|s| s.parse::<uuid::Uuid>().ok())
                    .and_then(|u| TaskId::try_from(u).ok()),
                assigned_agent_id: row
                    .get::<Option<String>, _>("assigned_agent_id")
                    .and_then(|s| s.parse::<uuid::Uuid>().ok())
                    .and_then(|u| AgentId::try_from(u).ok()),
                status: status_from_str(&row.get::<String, _>("status")),
                priority: priority_from_str(&row.get::<String, _>("priority")),
                parameters: serde_json::from_str(&parameters_str).unwrap_or(serde_json::json!({})),
                result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
                error: row.get("error"),
                created_at: from_unix_ms(row.get("created_at_unix_ms")),
                updated_at: from_unix_ms(row.get("updated_at_unix_ms")),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabasePath};
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, SqliteTaskStore) {
        let dir = TempDir::new().unwrap();
        let path = DatabasePath::new(dir.path().join("test.db")).unwrap();
        let connection = DatabaseConnection::initialize(DatabaseConfig::for_testing(path)).await.unwrap();
        (dir, SqliteTaskStore::new(connection))
    }

    #[tokio::test]
    async fn load_active_excludes_terminal_tasks() {
        let (_dir, store) = test_store().await;
        let active = PersistedTaskRecord {
            task_id: TaskId::generate(),
            task_type: "reprice".into(),
            parent_id: None,
            assigned_agent_id: None,
            status: TaskStatus::Processing,
            priority: Priority::Normal,
            parameters: serde_json::json!({}),
            result: None,
            error: None,
            created_at: SystemTime::now(),
            updated_at: SystemTime::now(),
        };
        let mut done = active.clone();
        done.task_id = TaskId::generate();
        done.status = TaskStatus::Completed;

        store.upsert(&active).await.unwrap();
        store.upsert(&done).await.unwrap();

        let loaded = store.load_active().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].task_id, active.task_id);
    }
}
