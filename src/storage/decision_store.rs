//! Persistence for agent decision audit trail and rolling performance metrics.

use async_trait::async_trait;
use sqlx::Row;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::database::{DatabaseConnection, DatabaseError, DatabaseResult, StorageError};
use crate::domain_types::{AgentId, TaskId};

/// One recorded decision an agent made, kept for audit and debugging.
#[derive(Debug, Clone)]
pub struct AgentDecisionRecord {
    /// Unique id.
    pub decision_id: String,
    /// Deciding agent.
    pub agent_id: AgentId,
    /// Task the decision pertains to, if any.
    pub task_id: Option<TaskId>,
    /// Machine-readable decision category (e.g. `"reprice"`, `"escalate"`).
    pub decision_type: String,
    /// Human-readable justification.
    pub rationale: String,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f64,
    /// When the decision was recorded.
    pub recorded_at: SystemTime,
}

/// One rolling performance sample for a component/metric pair.
#[derive(Debug, Clone)]
pub struct PerformanceMetricRecord {
    /// Unique id.
    pub metric_id: String,
    /// Owning component name (e.g. `"pipeline_controller"`).
    pub component: String,
    /// Metric name (e.g. `"stage_duration_ms"`).
    pub metric_name: String,
    /// Sample value.
    pub value: f64,
    /// When the sample was recorded.
    pub recorded_at: SystemTime,
}

/// Persistence interface for the agent decision audit trail.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// Records one decision.
    async fn record(&self, decision: &AgentDecisionRecord) -> DatabaseResult<()>;
    /// Fetches recent decisions for one agent, most recent first.
    async fn recent_for_agent(&self, agent_id: AgentId, limit: usize) -> DatabaseResult<Vec<AgentDecisionRecord>>;
}

/// Persistence interface for rolling performance metrics.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Records one sample.
    async fn record(&self, metric: &PerformanceMetricRecord) -> DatabaseResult<()>;
    /// Fetches recent samples for one component/metric pair, most recent first.
    async fn recent(&self, component: &str, metric_name: &str, limit: usize) -> DatabaseResult<Vec<PerformanceMetricRecord>>;
}

/// `SQLite`-backed `DecisionStore` and `MetricStore`, sharing one connection.
pub struct SqliteTelemetryStore {
    connection: DatabaseConnection,
}

impl SqliteTelemetryStore {
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
impl DecisionStore for SqliteTelemetryStore {
    async fn record(&self, decision: &AgentDecisionRecord) -> DatabaseResult<()> {
        sqlx::query(
            "INSERT INTO agent_decisions (decision_id, agent_id, task_id, decision_type, rationale, confidence, recorded_at_unix_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&decision.decision_id)
        .bind(decision.agent_id.to_string())
        .bind(decision.task_id.map(|id| id.to_string()))
        .bind(&decision.decision_type)
        .bind(&decision.rationale)
        .bind(decision.confidence)
        .bind(to_unix_ms(decision.recorded_at))
        .execute(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;
        Ok(())
    }

    async fn recent_for_agent(&self, agent_id: AgentId, limit: usize) -> DatabaseResult<Vec<AgentDecisionRecord>> {
        let rows = sqlx::query(
            "SELECT decision_id, agent_id, task_id, decision_type, rationale, confidence, recorded_at_unix_ms
             FROM agent_decisions WHERE agent_id = ? ORDER BY recorded_at_unix_ms DESC LIMIT ?",
        )
        .bind(agent_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;

        Ok(rows
            .into_iter()
            .map(|row| AgentDecisionRecord {
                decision_id: row.get("decision_id"),
                agent_id,
                task_id: row
                    .get::<Option<String>, _>("task_id")
                    .and_then(|s| s.parse::<uuid::Uuid>().ok())
                    .and_then(|u| TaskId::try_from(u).ok()),
                decision_type: row.get("decision_type"),
                rationale: row.get("rationale"),
                confidence: row.get("confidence"),
                recorded_at: from_unix_ms(row.get("recorded_at_unix_ms")),
            })
            .collect())
    }
}

#[async_trait]
impl MetricStore for SqliteTelemetryStore {
    async fn record(&self, metric: &PerformanceMetricRecord) -> DatabaseResult<()> {
        sqlx::query(
            "INSERT INTO performance_metrics (metric_id, component, metric_name, value, recorded_at_unix_ms)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&metric.metric_id)
        .bind(&metric.component)
        .bind(&metric.metric_name)
        .bind(metric.value)
        .bind(to_unix_ms(metric.recorded_at))
        .execute(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;
        Ok(())
    }

    async fn recent(&self, component: &str, metric_name: &str, limit: usize) -> DatabaseResult<Vec<PerformanceMetricRecord>> {
        let rows = sqlx::query(
            "SELECT metric_id, component, metric_name, value, recorded_at_unix_ms
             FROM performance_metrics WHERE component = ? AND metric_name = ? ORDER BY recorded_at_unix_ms DESC LIMIT ?",
        )
        .bind(component)
        .bind(metric_name)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| DatabaseError::Storage(StorageError::Database { message: e.to_string() }))?;

        Ok(rows
            .into_iter()
            .map(|row| PerformanceMetricRecord {
                metric_id: row.get("metric_id"),
                component: row.get("component"),
                metric_name: row.get("metric_name"),
                value: row.get("value"),
                recorded_at: from_unix_ms(row.get("recorded_at_unix_ms")),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabasePath};
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, SqliteTelemetryStore) {
        let dir = TempDir::new().unwrap();
        let path = DatabasePath::new(dir.path().join("test.db")).unwrap();
        let connection = DatabaseConnection::initialize(DatabaseConfig::for_testing(path)).await.unwrap();
        (dir, SqliteTelemetryStore::new(connection))
    }

    #[tokio::test]
    async fn decision_round_trips_and_is_scoped_to_agent() {
        let (_dir, store) = test_store().await;
        let agent_id = AgentId::generate();
        DecisionStore::record(&store, &AgentDecisionRecord {
                decision_id: "d1".into(),
                agent_id,
                task_id: None,
                decision_type: "reprice".into(),
                rationale: "demand spike".into(),
                confidence: 0.9,
                recorded_at: SystemTime::now(),
            })
            .await
            .unwrap();

        let decisions = store.recent_for_agent(agent_id, 10).await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].decision_type, "reprice");

        let other_agent_decisions = store.recent_for_agent(AgentId::generate(), 10).await.unwrap();
        assert!(other_agent_decisions.is_empty());
    }

    #[tokio::test]
    async fn metric_samples_are_scoped_to_component_and_name() {
        let (_dir, store) = test_store().await;
        MetricStore::record(
            &store,
            &PerformanceMetricRecord {
                metric_id: "m1".into(),
                component: "pipeline_controller".into(),
                metric_name: "stage_duration_ms".into(),
                value: 42.0,
                recorded_at: SystemTime::now(),
            },
        )
        .await
        .unwrap();

        let samples = store.recent("pipeline_controller", "stage_duration_ms", 5).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert!((samples[0].value - 42.0).abs() < f64::EPSILON);
    }
}
