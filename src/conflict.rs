//! Conflict detection and resolution across contending entities.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::bus::{Event, EventBus};
use crate::domain_types::ConflictId;

/// What kind of entities are contending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConflictKind {
    /// Two or more agents want the same resource.
    Resource,
    /// Two or more tasks target the same outcome.
    Task,
    /// Two or more agents disagree on ownership/role.
    Agent,
    /// Conflicting priority assignments.
    Priority,
    /// Conflicting claims of authority/ownership.
    Authority,
    /// Conflicting capability declarations.
    Capability,
    /// Conflicting data values for the same field.
    Data,
    /// Anything not covered above.
    Other,
}

/// Strategy used to resolve a conflict.
#[derive(Clone)]
pub enum ResolutionStrategy {
    /// Highest `params.priority_field` (default `"priority"`) wins.
    Priority,
    /// Highest `params.authority_field` (default `"authority"`) wins.
    Authority,
    /// Most common `params.value_field` (default `"value"`) wins.
    Consensus,
    /// First entity wins.
    First,
    /// Last entity wins.
    Last,
    /// Shallow-merge all entities; later entities override earlier ones for
    /// overlapping keys, restricted to `params.merge_fields` if given.
    Merge,
    /// No automatic resolution; caller handles cancellation out of band.
    Cancel,
    /// No automatic resolution; caller delegates to another authority.
    Delegate,
    /// Custom resolution function.
    Custom(Arc<dyn Fn(&[Value], &HashMap<String, Value>) -> Option<Value> + Send + Sync>),
}

impl std::fmt::Debug for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Priority => write!(f, "Priority"),
            Self::Authority => write!(f, "Authority"),
            Self::Consensus => write!(f, "Consensus"),
            Self::First => write!(f, "First"),
            Self::Last => write!(f, "Last"),
            Self::Merge => write!(f, "Merge"),
            Self::Cancel => write!(f, "Cancel"),
            Self::Delegate => write!(f, "Delegate"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl ResolutionStrategy {
    /// The strategy applied by default for a given conflict kind, per the
    /// mapping: Resource/Task/Other -> Priority; Agent/Priority/Authority/
    /// Capability -> Authority; Data -> Last.
    #[must_use]
    pub fn default_for_kind(kind: ConflictKind) -> Self {
        match kind {
            ConflictKind::Resource | ConflictKind::Task | ConflictKind::Other => Self::Priority,
            ConflictKind::Agent | ConflictKind::Priority | ConflictKind::Authority | ConflictKind::Capability => {
                Self::Authority
            }
            ConflictKind::Data => Self::Last,
        }
    }
}

/// Lifecycle status of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConflictStatus {
    /// Just detected, not yet examined.
    Detected,
    /// Being examined before a resolution attempt.
    Analyzing,
    /// A resolution strategy is being applied.
    Resolving,
    /// Resolved with a concrete winning value.
    Resolved,
    /// No strategy could produce a winner.
    Unresolvable,
    /// Deliberately left unresolved.
    Ignored,
}

/// A detected conflict and, once resolved, its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    /// Unique id.
    pub id: ConflictId,
    /// Kind of contention.
    pub kind: ConflictKind,
    /// The contending entities, as opaque structured values.
    pub entities: Vec<Value>,
    /// Human-readable description.
    pub description: String,
    /// Arbitrary metadata.
    pub metadata: HashMap<String, Value>,
    /// Current status.
    pub status: ConflictStatus,
    /// When this conflict was detected.
    pub detected_at: SystemTime,
    /// When this conflict reached a terminal status, if it has.
    pub resolved_at: Option<SystemTime>,
    /// Name of the strategy applied, once one has been.
    #[serde(skip)]
    pub applied_strategy: Option<ResolutionStrategy>,
    /// The winning value, once Resolved.
    pub resolution: Option<Value>,
    /// Reason given for Unresolvable/Ignored.
    pub reason: Option<String>,
}

/// Errors raised by conflict resolution operations.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// No such conflict.
    #[error("conflict not found: {0}")]
    NotFound(ConflictId),
    /// The conflict was already in a terminal status.
    #[error("conflict already terminal")]
    AlreadyTerminal,
}

/// Detects and resolves conflicts between contending entities.
pub struct ConflictResolver {
    conflicts: DashMap<ConflictId, Conflict>,
    bus: Arc<EventBus>,
}

impl ConflictResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            conflicts: DashMap::new(),
            bus,
        }
    }

    /// Records a new conflict in `Detected` status and emits a notification.
    #[instrument(skip(self, entities, description, metadata))]
    pub async fn detect(
        &self,
        kind: ConflictKind,
        entities: Vec<Value>,
        description: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> ConflictId {
        let id = ConflictId::generate();
        let conflict = Conflict {
            id,
            kind,
            entities,
            description: description.into(),
            metadata,
            status: ConflictStatus::Detected,
            detected_at: SystemTime::now(),
            resolved_at: None,
            applied_strategy: None,
            resolution: None,
            reason: None,
        };
        self.conflicts.insert(id, conflict);
        let _ = self
            .bus
            .publish(Event::notification(
                "conflict_detected",
                "conflict_resolver",
                serde_json::json!({ "conflict_id": id.to_string(), "kind": format!("{kind:?}") }),
            ))
            .await;
        id
    }

    /// Resolves `id` using `strategy`, or the kind's default strategy if `None`.
    ///
    /// # Errors
    ///
    /// Returns `ConflictError` if the conflict is missing or already terminal.
    pub async fn resolve(
        &self,
        id: ConflictId,
        strategy: Option<ResolutionStrategy>,
        params: HashMap<String, Value>,
    ) -> Result<Value, ConflictError> {
        let (kind, entities, status) = {
            let conflict = self.conflicts.get(&id).ok_or(ConflictError::NotFound(id))?;
            (conflict.kind, conflict.entities.clone(), conflict.status)
        };
        if matches!(status, ConflictStatus::Resolved | ConflictStatus::Unresolvable | ConflictStatus::Ignored) {
            return Err(ConflictError::AlreadyTerminal);
        }

        {
            let mut conflict = self.conflicts.get_mut(&id).ok_or(ConflictError::NotFound(id))?;
            conflict.status = ConflictStatus::Resolving;
        }

        let strategy = strategy.unwrap_or_else(|| ResolutionStrategy::default_for_kind(kind));
        let outcome = apply_strategy(&strategy, &entities, &params);

        let mut conflict = self.conflicts.get_mut(&id).ok_or(ConflictError::NotFound(id))?;
        conflict.applied_strategy = Some(strategy);
        conflict.resolved_at = Some(SystemTime::now());
        match outcome {
            Some(value) => {
                conflict.status = ConflictStatus::Resolved;
                conflict.resolution = Some(value.clone());
                drop(conflict);
                let _ = self
                    .bus
                    .publish(Event::notification(
                        "conflict_resolved",
                        "conflict_resolver",
                        serde_json::json!({ "conflict_id": id.to_string(), "resolution": value }),
                    ))
                    .await;
                Ok(value)
            }
            None => {
                conflict.status = ConflictStatus::Unresolvable;
                drop(conflict);
                let _ = self
                    .bus
                    .publish(Event::notification(
                        "conflict_unresolvable",
                        "conflict_resolver",
                        serde_json::json!({ "conflict_id": id.to_string() }),
                    ))
                    .await;
                Ok(Value::Null)
            }
        }
    }

    /// Marks a conflict unresolvable with a caller-supplied reason.
    ///
    /// # Errors
    ///
    /// Returns `ConflictError::NotFound` if `id` does not exist.
    pub async fn mark_unresolvable(&self, id: ConflictId, reason: impl Into<String>) -> Result<(), ConflictError> {
        {
            let mut conflict = self.conflicts.get_mut(&id).ok_or(ConflictError::NotFound(id))?;
            conflict.status = ConflictStatus::Unresolvable;
            conflict.reason = Some(reason.into());
            conflict.resolved_at = Some(SystemTime::now());
        }
        let _ = self
            .bus
            .publish(Event::notification(
                "conflict_unresolvable",
                "conflict_resolver",
                serde_json::json!({ "conflict_id": id.to_string() }),
            ))
            .await;
        Ok(())
    }

    /// Marks a conflict deliberately ignored with a caller-supplied reason.
    ///
    /// # Errors
    ///
    /// Returns `ConflictError::NotFound` if `id` does not exist.
    pub async fn ignore(&self, id: ConflictId, reason: impl Into<String>) -> Result<(), ConflictError> {
        {
            let mut conflict = self.conflicts.get_mut(&id).ok_or(ConflictError::NotFound(id))?;
            conflict.status = ConflictStatus::Ignored;
            conflict.reason = Some(reason.into());
            conflict.resolved_at = Some(SystemTime::now());
        }
        let _ = self
            .bus
            .publish(Event::notification(
                "conflict_ignored",
                "conflict_resolver",
                serde_json::json!({ "conflict_id": id.to_string() }),
            ))
            .await;
        Ok(())
    }

    /// Fetches a snapshot of a conflict.
    #[must_use]
    pub fn get(&self, id: ConflictId) -> Option<Conflict> {
        self.conflicts.get(&id).map(|entry| entry.value().clone())
    }

    /// All conflicts of a given kind.
    #[must_use]
    pub fn find_by_kind(&self, kind: ConflictKind) -> Vec<Conflict> {
        self.conflicts
            .iter()
            .filter(|entry| entry.value().kind == kind)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// All conflicts still in a non-terminal status.
    #[must_use]
    pub fn active(&self) -> Vec<Conflict> {
        self.conflicts
            .iter()
            .filter(|entry| {
                !matches!(
                    entry.value().status,
                    ConflictStatus::Resolved | ConflictStatus::Unresolvable | ConflictStatus::Ignored
                )
            })
            .map(|entry| entry.value().clone())
            .collect()
    }
}

fn apply_strategy(strategy: &ResolutionStrategy, entities: &[Value], params: &HashMap<String, Value>) -> Option<Value> {
    match strategy {
        ResolutionStrategy::Priority => pick_by_numeric_field(entities, field_name(params, "priority_field", "priority")),
        ResolutionStrategy::Authority => pick_by_numeric_field(entities, field_name(params, "authority_field", "authority")),
        ResolutionStrategy::Consensus => pick_by_consensus(entities, field_name(params, "value_field", "value")),
        ResolutionStrategy::First => entities.first().cloned(),
        ResolutionStrategy::Last => entities.last().cloned(),
        ResolutionStrategy::Merge => Some(merge_entities(entities, params.get("merge_fields"))),
        ResolutionStrategy::Cancel | ResolutionStrategy::Delegate => None,
        ResolutionStrategy::Custom(resolve_fn) => resolve_fn(entities, params),
    }
}

fn field_name<'a>(params: &'a HashMap<String, Value>, key: &str, default: &'a str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn pick_by_numeric_field(entities: &[Value], field: &str) -> Option<Value> {
    entities
        .iter()
        .filter_map(|entity| entity.get(field).and_then(Value::as_f64).map(|value| (value, entity)))
        .max_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, entity)| entity.clone())
}

fn pick_by_consensus(entities: &[Value], field: &str) -> Option<Value> {
    let mut counts: HashMap<String, (usize, Value)> = HashMap::new();
    for entity in entities {
        if let Some(value) = entity.get(field) {
            let key = value.to_string();
            counts.entry(key).or_insert_with(|| (0, value.clone())).0 += 1;
        }
    }
    counts.into_values().max_by_key(|(count, _)| *count).map(|(_, value)| value)
}

fn merge_entities(entities: &[Value], merge_fields: Option<&Value>) -> Value {
    let allowed: Option<Vec<String>> = merge_fields.and_then(|fields| {
        fields.as_array().map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
    });

    let mut merged = serde_json::Map::new();
    for entity in entities {
        if let Value::Object(fields) = entity {
            for (key, value) in fields {
                if let Some(allowed) = &allowed {
                    if !allowed.contains(key) {
                        continue;
                    }
                }
                if value.is_null() {
                    continue;
                }
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn harness() -> ConflictResolver {
        ConflictResolver::new(Arc::new(EventBus::new(64, Duration::from_millis(100))))
    }

    #[tokio::test]
    async fn merge_strategy_combines_disjoint_and_overrides_overlapping_fields() {
        let resolver = harness();
        let id = resolver
            .detect(
                ConflictKind::Data,
                vec![
                    serde_json::json!({"price": 10, "qty": 1}),
                    serde_json::json!({"qty": 2, "color": "red"}),
                ],
                "price/qty disagreement",
                HashMap::new(),
            )
            .await;

        let result = resolver.resolve(id, Some(ResolutionStrategy::Merge), HashMap::new()).await.unwrap();
        assert_eq!(result, serde_json::json!({"price": 10, "qty": 2, "color": "red"}));
    }

    #[tokio::test]
    async fn priority_strategy_picks_highest_priority_entity() {
        let resolver = harness();
        let id = resolver
            .detect(
                ConflictKind::Resource,
                vec![
                    serde_json::json!({"priority": 1, "owner": "a"}),
                    serde_json::json!({"priority": 9, "owner": "b"}),
                ],
                "resource contention",
                HashMap::new(),
            )
            .await;

        let result = resolver.resolve(id, None, HashMap::new()).await.unwrap();
        assert_eq!(result["owner"], "b");
    }

    #[tokio::test]
    async fn cancel_strategy_yields_unresolvable() {
        let resolver = harness();
        let id = resolver
            .detect(ConflictKind::Other, vec![serde_json::json!({})], "x", HashMap::new())
            .await;

        let result = resolver.resolve(id, Some(ResolutionStrategy::Cancel), HashMap::new()).await.unwrap();
        assert!(result.is_null());
        assert_eq!(resolver.get(id).unwrap().status, ConflictStatus::Unresolvable);
    }

    #[tokio::test]
    async fn default_strategy_for_data_kind_is_last() {
        let resolver = harness();
        let id = resolver
            .detect(
                ConflictKind::Data,
                vec![serde_json::json!({"value": "a"}), serde_json::json!({"value": "b"})],
                "x",
                HashMap::new(),
            )
            .await;
        let result = resolver.resolve(id, None, HashMap::new()).await.unwrap();
        assert_eq!(result["value"], "b");
    }
}
