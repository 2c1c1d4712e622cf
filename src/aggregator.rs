//! Result aggregation with pluggable combine strategies.
//!
//! Aggregation is a pure function of the recorded entries: `aggregate` never
//! consumes them, matching the Open Question decision recorded in
//! DESIGN.md (preserve entries across repeated aggregation calls).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use crate::bus::{Event, EventBus};
use crate::domain_types::{AgentId, TaskId};

/// Combine strategy applied when aggregating a task's collected results.
#[derive(Clone)]
pub enum AggregationStrategy {
    /// Return the full `{agent_id -> result}` map.
    Collect,
    /// Return the most common result (compared by string form).
    Majority,
    /// Return `sum(result * metadata.weight) / sum(weight)`; requires numeric
    /// results and a numeric `weight` metadata field on every entry.
    Weighted,
    /// Return the first-received entry's result.
    First,
    /// Return the last-received entry's result.
    Last,
    /// Invoke a custom combine function over all entries.
    Custom(Arc<dyn Fn(&[ResultEntry]) -> Value + Send + Sync>),
}

impl std::fmt::Debug for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Collect => write!(f, "Collect"),
            Self::Majority => write!(f, "Majority"),
            Self::Weighted => write!(f, "Weighted"),
            Self::First => write!(f, "First"),
            Self::Last => write!(f, "Last"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// One recorded contribution toward a task's aggregate result.
#[derive(Debug, Clone)]
pub struct ResultEntry {
    /// Contributing agent.
    pub agent_id: AgentId,
    /// The agent's result payload.
    pub result: Value,
    /// Arbitrary metadata (e.g. `{"weight": 2.0}` for Weighted aggregation).
    pub metadata: HashMap<String, Value>,
    /// Order this entry was received in, relative to other entries for the same task.
    pub sequence: u64,
}

/// Errors raised by aggregation operations.
#[derive(Debug, Error)]
pub enum AggregationError {
    /// No strategy was registered for this task.
    #[error("task not registered for aggregation: {0}")]
    NotRegistered(TaskId),
    /// Weighted aggregation found a non-numeric result or zero total weight.
    #[error("weighted aggregation requires numeric results and nonzero total weight")]
    InvalidWeightedInput,
}

struct TaskAggregation {
    strategy: AggregationStrategy,
    entries: Vec<ResultEntry>,
    next_sequence: u64,
}

/// Collects per-task results and combines them per a registered strategy.
pub struct ResultAggregator {
    tasks: DashMap<TaskId, TaskAggregation>,
    bus: Arc<EventBus>,
}

impl ResultAggregator {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            tasks: DashMap::new(),
            bus,
        }
    }

    /// Registers (or replaces) the aggregation strategy for a task.
    pub fn register_task(&self, task_id: TaskId, strategy: AggregationStrategy) {
        self.tasks.insert(
            task_id,
            TaskAggregation {
                strategy,
                entries: Vec::new(),
                next_sequence: 0,
            },
        );
    }

    /// Records a contribution from `agent_id` toward `task_id`'s aggregate.
    ///
    /// # Errors
    ///
    /// Returns `AggregationError::NotRegistered` if `register_task` was never called for `task_id`.
    pub fn add_result(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        result: Value,
        metadata: HashMap<String, Value>,
    ) -> Result<(), AggregationError> {
        let mut entry = self.tasks.get_mut(&task_id).ok_or(AggregationError::NotRegistered(task_id))?;
        let sequence = entry.next_sequence;
        entry.next_sequence += 1;
        entry.entries.push(ResultEntry {
            agent_id,
            result,
            metadata,
            sequence,
        });
        Ok(())
    }

    /// All entries recorded for `task_id`, in receipt order.
    #[must_use]
    pub fn get_results(&self, task_id: TaskId) -> Vec<ResultEntry> {
        self.tasks.get(&task_id).map(|entry| entry.entries.clone()).unwrap_or_default()
    }

    /// Combines `task_id`'s recorded entries per its registered strategy.
    /// Idempotent and non-consuming: calling this repeatedly with unchanged
    /// inputs yields the same value.
    ///
    /// # Errors
    ///
    /// Returns `AggregationError` if the task isn't registered or Weighted
    /// aggregation's preconditions aren't met.
    pub async fn aggregate(&self, task_id: TaskId) -> Result<Value, AggregationError> {
        let value = {
            let entry = self.tasks.get(&task_id).ok_or(AggregationError::NotRegistered(task_id))?;
            combine(&entry.strategy, &entry.entries)?
        };

        let _ = self
            .bus
            .publish(Event::notification(
                "final_result",
                "result_aggregator",
                serde_json::json!({ "task_id": task_id.to_string(), "result": value }),
            ))
            .await;

        Ok(value)
    }

    /// Drops all recorded entries and strategy for `task_id`.
    pub fn clear(&self, task_id: TaskId) {
        self.tasks.remove(&task_id);
    }
}

fn combine(strategy: &AggregationStrategy, entries: &[ResultEntry]) -> Result<Value, AggregationError> {
    match strategy {
        AggregationStrategy::Collect => {
            let mut map = serde_json::Map::new();
            for entry in entries {
                map.insert(entry.agent_id.to_string(), entry.result.clone());
            }
            Ok(Value::Object(map))
        }
        AggregationStrategy::Majority => {
            let mut counts: HashMap<String, (usize, Value)> = HashMap::new();
            for entry in entries {
                let key = entry.result.to_string();
                counts.entry(key).or_insert_with(|| (0, entry.result.clone())).0 += 1;
            }
            Ok(counts
                .into_values()
                .max_by_key(|(count, _)| *count)
                .map_or(Value::Null, |(_, value)| value))
        }
        AggregationStrategy::Weighted => {
            let mut weighted_sum = 0.0;
            let mut total_weight = 0.0;
            for entry in entries {
                let value = entry.result.as_f64().ok_or(AggregationError::InvalidWeightedInput)?;
                let weight = entry
                    .metadata
                    .get("weight")
                    .and_then(serde_json::Value::as_f64)
                    .ok_or(AggregationError::InvalidWeightedInput)?;
                weighted_sum += value * weight;
                total_weight += weight;
            }
            if total_weight == 0.0 {
                return Ok(Value::Null);
            }
            Ok(serde_json::json!(weighted_sum / total_weight))
        }
        AggregationStrategy::First => Ok(entries
            .iter()
            .min_by_key(|entry| entry.sequence)
            .map_or(Value::Null, |entry| entry.result.clone())),
        AggregationStrategy::Last => Ok(entries
            .iter()
            .max_by_key(|entry| entry.sequence)
            .map_or(Value::Null, |entry| entry.result.clone())),
        AggregationStrategy::Custom(combine_fn) => Ok(combine_fn(entries)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn harness() -> (Arc<EventBus>, ResultAggregator) {
        let bus = Arc::new(EventBus::new(64, Duration::from_millis(100)));
        let aggregator = ResultAggregator::new(Arc::clone(&bus));
        (bus, aggregator)
    }

    #[tokio::test]
    async fn collect_returns_map_of_all_entries() {
        let (_, aggregator) = harness();
        let task = TaskId::generate();
        aggregator.register_task(task, AggregationStrategy::Collect);
        let a1 = AgentId::generate();
        let a2 = AgentId::generate();
        aggregator.add_result(task, a1, serde_json::json!(1), HashMap::new()).unwrap();
        aggregator.add_result(task, a2, serde_json::json!(2), HashMap::new()).unwrap();

        let result = aggregator.aggregate(task).await.unwrap();
        assert_eq!(result.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn weighted_computes_weighted_average() {
        let (_, aggregator) = harness();
        let task = TaskId::generate();
        aggregator.register_task(task, AggregationStrategy::Weighted);
        aggregator
            .add_result(task, AgentId::generate(), serde_json::json!(10.0), HashMap::from([("weight".into(), serde_json::json!(1.0))]))
            .unwrap();
        aggregator
            .add_result(task, AgentId::generate(), serde_json::json!(20.0), HashMap::from([("weight".into(), serde_json::json!(3.0))]))
            .unwrap();

        let result = aggregator.aggregate(task).await.unwrap();
        assert!((result.as_f64().unwrap() - 17.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn aggregate_is_idempotent_and_non_consuming() {
        let (_, aggregator) = harness();
        let task = TaskId::generate();
        aggregator.register_task(task, AggregationStrategy::Last);
        aggregator.add_result(task, AgentId::generate(), serde_json::json!("a"), HashMap::new()).unwrap();
        aggregator.add_result(task, AgentId::generate(), serde_json::json!("b"), HashMap::new()).unwrap();

        let first = aggregator.aggregate(task).await.unwrap();
        let second = aggregator.aggregate(task).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(aggregator.get_results(task).len(), 2);
    }

    #[tokio::test]
    async fn weighted_with_zero_total_weight_returns_null() {
        let (_, aggregator) = harness();
        let task = TaskId::generate();
        aggregator.register_task(task, AggregationStrategy::Weighted);
        aggregator
            .add_result(task, AgentId::generate(), serde_json::json!(10.0), HashMap::from([("weight".into(), serde_json::json!(0.0))]))
            .unwrap();

        let result = aggregator.aggregate(task).await.unwrap();
        assert!(result.is_null());
    }
}
