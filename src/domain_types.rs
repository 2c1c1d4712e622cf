//! Domain newtypes for the coordination runtime.
//!
//! Every identifier and bounded numeric value that crosses a component
//! boundary is wrapped so that mixing up, say, a `TaskId` and a `ConflictId`
//! is a compile error rather than a runtime one.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a registered agent.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct AgentId(Uuid);

impl AgentId {
    /// Generates a fresh random agent id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a task.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random task id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a detected conflict.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Generates a fresh random conflict id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a single bus event.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random event id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a message on the protocol layer.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a fresh random message id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Correlates a request/response exchange, or a multi-agent workflow run.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generates a fresh random correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a pipeline execution run.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Generates a fresh random execution id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a subscription on the event bus.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Generates a fresh random subscription id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Non-empty human readable agent name.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
    )
)]
pub struct AgentName(String);

/// Category an agent belongs to. Drives capability-matching and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentCategory {
    /// Pricing / demand / competitor tracking.
    Market,
    /// High-level decision making and approvals.
    Executive,
    /// Listing copy and media generation.
    Content,
    /// Shipping, inventory movement, fulfillment.
    Logistics,
    /// Platform-internal agents (health, metrics).
    System,
    /// Domain specialists not covered above.
    Specialist,
    /// General-purpose helper used as a routing fallback.
    Utility,
    /// Mobile-constrained workers (battery/network aware scheduling).
    Mobile,
}

impl std::fmt::Display for AgentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Market => "market",
            Self::Executive => "executive",
            Self::Content => "content",
            Self::Logistics => "logistics",
            Self::System => "system",
            Self::Specialist => "specialist",
            Self::Utility => "utility",
            Self::Mobile => "mobile",
        };
        f.write_str(s)
    }
}

/// Coarse agent health/lifecycle status tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AgentStatus {
    /// Registered but not yet confirmed alive.
    #[default]
    Unknown,
    /// Mid-registration handshake.
    Registering,
    /// Healthy and accepting work.
    Active,
    /// Healthy but at capacity.
    Busy,
    /// Deliberately taken offline.
    Inactive,
    /// Missed heartbeats past the disconnect threshold.
    Disconnected,
    /// Reported an unrecoverable internal error.
    Error,
}

impl AgentStatus {
    /// Whether the agent may currently be assigned new work.
    #[must_use]
    pub fn is_available(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Named capability an agent offers, with optional numeric and tag
/// constraints used for matching against a requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Capability name, matched exactly against a requirement.
    pub name: String,
    /// Parameter names the capability accepts.
    pub parameters: Vec<String>,
    /// Numeric constraints, e.g. `max_items -> 500`.
    pub numeric_constraints: std::collections::BTreeMap<String, f64>,
    /// Free-form tags describing the capability (e.g. marketplace names).
    pub tags: std::collections::BTreeSet<String>,
}

impl Capability {
    /// Creates a bare capability with no parameters, constraints or tags.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            numeric_constraints: std::collections::BTreeMap::new(),
            tags: std::collections::BTreeSet::new(),
        }
    }

    /// Adds a tag, builder-style.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Adds a parameter name, builder-style.
    #[must_use]
    pub fn with_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.parameters.push(parameter.into());
        self
    }

    /// Adds a numeric constraint, builder-style.
    #[must_use]
    pub fn with_numeric_constraint(mut self, key: impl Into<String>, value: f64) -> Self {
        self.numeric_constraints.insert(key.into(), value);
        self
    }

    /// Whether `self`, treated as a requirement, is satisfied by `offered`.
    ///
    /// Matching rule: names must be equal, every parameter required by
    /// `self` must be present in `offered`, every tag required by `self`
    /// must be a subset of `offered`'s tags, and every numeric constraint
    /// required by `self` must be less than or equal to the corresponding
    /// constraint in `offered`.
    #[must_use]
    pub fn is_satisfied_by(&self, offered: &Self) -> bool {
        if self.name != offered.name {
            return false;
        }
        if !self.parameters.iter().all(|p| offered.parameters.contains(p)) {
            return false;
        }
        if !self.tags.is_subset(&offered.tags) {
            return false;
        }
        self.numeric_constraints.iter().all(|(key, required)| {
            offered
                .numeric_constraints
                .get(key)
                .is_some_and(|offered_value| offered_value >= required)
        })
    }
}

/// Priority shared by messages, events and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    /// Best-effort, may be dropped under backpressure.
    Low,
    /// Default priority for ordinary work.
    #[default]
    Normal,
    /// Expedited; bypasses drop-oldest overflow policy.
    High,
    /// Must never be dropped.
    Critical,
}

#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default),
    default = 1024
)]
/// Bounded capacity of a single event-bus subscription queue.
pub struct QueueCapacity(usize);

#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default),
    default = 3
)]
/// Maximum retry attempts for a pipeline stage.
pub struct RetryCount(u32);

#[nutype(
    validate(greater = 0, less_or_equal = 100),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default),
    default = 10
)]
/// Bounded `SQLite` connection pool size.
pub struct ConnectionPoolSize(u32);

impl ConnectionPoolSize {
    /// Returns the pool size as `usize`, for `sqlx::Pool` sizing APIs.
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.into_inner() as usize
    }
}
