//! Coordinator configuration for development and production environments.
//!
//! Provides pre-configured settings optimized for different deployment
//! scenarios, with validation and an override builder. Loaded once at
//! process start and threaded through the root coordinator value; no
//! component reads the environment directly.

#![allow(clippy::struct_excessive_bools)]

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors raised while building or overriding a `CoordinatorConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed its validated-newtype constructor.
    #[error("invalid configuration: {field} - {reason}")]
    Validation {
        /// Name of the offending field.
        field: String,
        /// Human readable reason.
        reason: String,
    },
}

#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default),
    default = 1024
)]
/// Bounded capacity for a single event-bus subscription queue.
pub struct BusQueueCapacity(usize);

#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default),
    default = 5_000
)]
/// Milliseconds a blocking publish waits before giving up under backpressure.
pub struct PublishBlockTimeoutMs(u64);

#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default),
    default = 60_000
)]
/// Milliseconds between agent registry health-check sweeps.
pub struct HealthCheckIntervalMs(u64);

#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default),
    default = 30_000
)]
/// Milliseconds between task-deadline monitor sweeps.
pub struct DeadlineMonitorIntervalMs(u64);

#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default),
    default = 1_800_000
)]
/// Milliseconds of inactivity before a conversation is eligible for cleanup.
pub struct ConversationTimeoutMs(u64);

#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default),
    default = 30_000
)]
/// Default per-stage pipeline timeout in milliseconds, used when a stage
/// does not specify its own.
pub struct DefaultStageTimeoutMs(u64);

#[nutype(
    validate(greater_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default),
    default = 2.0
)]
/// Exponential backoff base (seconds) for pipeline stage retries.
pub struct RetryBackoffBaseSecs(f64);

#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default),
    default = 1024
)]
/// Maximum number of latency samples retained by the realtime broadcaster.
pub struct LatencyRingSize(usize);

/// Per-marketplace-category concurrent request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceRateLimits {
    /// Catalog lookups.
    pub catalog: usize,
    /// Inventory reads/writes.
    pub inventory: usize,
    /// Pricing updates.
    pub pricing: usize,
    /// Order queries.
    pub orders: usize,
    /// Listing create/update.
    pub listings: usize,
}

impl Default for MarketplaceRateLimits {
    fn default() -> Self {
        Self {
            catalog: 5,
            inventory: 2,
            pricing: 1,
            orders: 3,
            listings: 2,
        }
    }
}

/// Complete coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    // Event bus
    /// Default per-subscription bounded queue size.
    pub bus_queue_capacity: BusQueueCapacity,
    /// Timeout for a blocking publish of a Command/Query/Response under backpressure.
    pub publish_block_timeout_ms: PublishBlockTimeoutMs,

    // Agent registry
    /// Interval between health-check sweeps.
    pub health_check_interval_ms: HealthCheckIntervalMs,
    /// Duration of missed heartbeats before a ping is attempted.
    pub ping_after_idle_secs: u64,
    /// Duration of missed heartbeats before an agent is marked disconnected.
    pub disconnect_after_idle_secs: u64,

    // Task delegation
    /// Interval between deadline-monitor sweeps.
    pub deadline_monitor_interval_ms: DeadlineMonitorIntervalMs,

    // Conversations
    /// Inactivity window after which a conversation becomes eligible for cleanup.
    pub conversation_timeout_ms: ConversationTimeoutMs,
    /// Interval between conversation-cleanup sweeps.
    pub conversation_cleanup_interval_ms: u64,

    // Pipelines
    /// Per-stage timeout applied when a stage does not specify its own.
    pub default_stage_timeout_ms: DefaultStageTimeoutMs,
    /// Exponential backoff base for stage retries.
    pub retry_backoff_base_secs: RetryBackoffBaseSecs,

    // Realtime broadcaster
    /// Maximum retained latency samples per broadcaster instance.
    pub latency_ring_size: LatencyRingSize,

    // Marketplace collaborator
    /// Per-category concurrency limits applied by the marketplace client.
    pub marketplace_rate_limits: MarketplaceRateLimits,

    // Storage
    /// Path to the SQLite database file.
    pub storage_path: PathBuf,

    // Observability
    /// Enables verbose per-tick logging on background loops.
    pub enable_detailed_logs: bool,
}

impl CoordinatorConfig {
    /// Development configuration: short intervals, verbose logs, in-memory-ish storage.
    #[must_use]
    pub fn development() -> Self {
        Self {
            bus_queue_capacity: BusQueueCapacity::try_new(256).unwrap_or_default(),
            publish_block_timeout_ms: PublishBlockTimeoutMs::try_new(2_000).unwrap_or_default(),
            health_check_interval_ms: HealthCheckIntervalMs::try_new(10_000).unwrap_or_default(),
            ping_after_idle_secs: 20,
            disconnect_after_idle_secs: 60,
            deadline_monitor_interval_ms: DeadlineMonitorIntervalMs::try_new(5_000)
                .unwrap_or_default(),
            conversation_timeout_ms: ConversationTimeoutMs::try_new(300_000).unwrap_or_default(),
            conversation_cleanup_interval_ms: 60_000,
            default_stage_timeout_ms: DefaultStageTimeoutMs::try_new(10_000).unwrap_or_default(),
            retry_backoff_base_secs: RetryBackoffBaseSecs::try_new(1.5).unwrap_or_default(),
            latency_ring_size: LatencyRingSize::try_new(256).unwrap_or_default(),
            marketplace_rate_limits: MarketplaceRateLimits::default(),
            storage_path: PathBuf::from("./data/agorum-dev.db"),
            enable_detailed_logs: true,
        }
    }

    /// Production configuration: longer intervals, persistent storage path.
    #[must_use]
    pub fn production() -> Self {
        Self {
            bus_queue_capacity: BusQueueCapacity::try_new(4096).unwrap_or_default(),
            publish_block_timeout_ms: PublishBlockTimeoutMs::try_new(10_000).unwrap_or_default(),
            health_check_interval_ms: HealthCheckIntervalMs::try_new(60_000).unwrap_or_default(),
            ping_after_idle_secs: 60,
            disconnect_after_idle_secs: 300,
            deadline_monitor_interval_ms: DeadlineMonitorIntervalMs::try_new(30_000)
                .unwrap_or_default(),
            conversation_timeout_ms: ConversationTimeoutMs::try_new(1_800_000)
                .unwrap_or_default(),
            conversation_cleanup_interval_ms: 3_600_000,
            default_stage_timeout_ms: DefaultStageTimeoutMs::try_new(30_000).unwrap_or_default(),
            retry_backoff_base_secs: RetryBackoffBaseSecs::try_new(2.0).unwrap_or_default(),
            latency_ring_size: LatencyRingSize::try_new(1024).unwrap_or_default(),
            marketplace_rate_limits: MarketplaceRateLimits::default(),
            storage_path: PathBuf::from("./data/agorum.db"),
            enable_detailed_logs: false,
        }
    }

    /// Loads configuration from the process environment, falling back to the
    /// development preset for anything unset. `COORDINATOR_ENV=production`
    /// selects the production preset as the base before overrides apply.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = match std::env::var("COORDINATOR_ENV").as_deref() {
            Ok("production") => Self::production(),
            _ => Self::development(),
        };
        if let Ok(path) = std::env::var("COORDINATOR_DB_PATH") {
            config.storage_path = PathBuf::from(path);
        }
        config
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::development()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_and_production_presets_are_internally_consistent() {
        let dev = CoordinatorConfig::development();
        let prod = CoordinatorConfig::production();
        assert!(dev.bus_queue_capacity.into_inner() < prod.bus_queue_capacity.into_inner());
        assert!(dev.enable_detailed_logs);
        assert!(!prod.enable_detailed_logs);
    }

    #[test]
    fn from_env_defaults_to_development() {
        // SAFETY: test runs single-threaded with respect to this var via serial execution.
        unsafe {
            std::env::remove_var("COORDINATOR_ENV");
        }
        let config = CoordinatorConfig::from_env();
        assert!(config.enable_detailed_logs);
    }
}
