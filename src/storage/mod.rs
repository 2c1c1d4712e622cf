//! Persistent storage for recovery snapshots: agent status, conversation
//! transcripts, the task ledger, and the decision/metric audit trail.
//!
//! The live source of truth for most of these is an in-memory component
//! (`registry::AgentRegistry`, `delegator::TaskDelegator`); the stores here
//! exist so that state survives a process restart and so conversation
//! history/telemetry can outlive the in-memory window.

pub mod agent_store;
pub mod conversation_store;
pub mod decision_store;
pub mod task_store;

pub use agent_store::{AgentStatusRecord, AgentStore, SqliteAgentStore};
pub use conversation_store::{
    ConversationRecord, ConversationStore, InMemoryConversationStore, MessageRole,
    SqliteConversationStore, StoredMessage,
};
pub use decision_store::{
    AgentDecisionRecord, DecisionStore, MetricStore, PerformanceMetricRecord, SqliteTelemetryStore,
};
pub use task_store::{PersistedTaskRecord, SqliteTaskStore, TaskStore};
