//! Crate-wide error taxonomy.
//!
//! Each subsystem defines its own narrow error enum (see `bus::BusError`,
//! `registry::RegistryError`, `delegator::DelegationError`,
//! `conflict::ConflictError`, `pipeline::PipelineError`). `CoordinatorError`
//! is the conversion target at component boundaries and at the HTTP edge.

use crate::domain_types::{AgentId, ConflictId, TaskId};
use thiserror::Error;

/// Top-level error returned across coordinator component boundaries.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Malformed input at a boundary (HTTP body, chat text, pipeline config).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Caller lacks valid credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Caller is authenticated but not permitted to perform the operation.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// A referenced agent does not exist in the registry.
    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    /// A referenced task does not exist in the delegator.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// A referenced conflict does not exist in the resolver.
    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    /// A referenced conversation does not exist in storage.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// A downstream marketplace call failed after retries.
    #[error("marketplace error ({marketplace}, status {status}): {message}")]
    Marketplace {
        /// Marketplace name (e.g. "amazon", "ebay").
        marketplace: String,
        /// HTTP-equivalent status code returned by the marketplace.
        status: u16,
        /// Human readable detail.
        message: String,
    },

    /// Internal consistency failure: missing capability, invalid state
    /// transition, or an assignment policy that found no eligible agent.
    #[error("coordination error: {0}")]
    Coordination(String),

    /// Caller exceeded a rate limit; carries a retry hint in seconds.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimit {
        /// Seconds the caller should wait before retrying.
        retry_after_secs: u64,
    },

    /// Unrecoverable startup/configuration failure.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Database access failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Database migration failure.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem/network IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinatorError {
    /// A graceful, user-facing message for chat flows that hit an internal
    /// coordination failure, matching the tone the orchestrator should use
    /// rather than leaking internal detail to end users.
    #[must_use]
    pub fn user_facing_chat_message(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } => {
                "The marketplace is rate limiting us right now; please try again shortly."
            }
            Self::Marketplace { .. } => {
                "I couldn't reach the marketplace just now. I'll retry automatically."
            }
            _ => "I'm having trouble coordinating the agents right now; let me try a different approach.",
        }
    }
}

/// Result alias used throughout the coordination core.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
