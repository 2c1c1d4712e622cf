//! Root wiring: constructs every component (A-J) plus the storage and
//! external-collaborator layers and threads them through a single value
//! the binary and the REST layer share.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::aggregator::ResultAggregator;
use crate::bus::{EventBus, Filter};
use crate::communication::CommunicationManager;
use crate::config::CoordinatorConfig;
use crate::conflict::ConflictResolver;
use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use crate::delegator::TaskDelegator;
use crate::error::CoordinatorResult;
use crate::intent::ChatOrchestrator;
use crate::llm::{DeterministicLlmAdapter, LlmAdapter};
use crate::marketplace::{HttpMarketplaceClient, MarketplaceClient, MarketplaceCredentials};
use crate::pipeline::PipelineController;
use crate::realtime::RealtimeBroadcaster;
use crate::registry::AgentRegistry;
use crate::storage::{AgentStatusRecord, AgentStore, PersistedTaskRecord, SqliteAgentStore, SqliteConversationStore, SqliteTaskStore, SqliteTelemetryStore, TaskStore};
use crate::time_provider::production_time_provider;

/// Every live component, held behind `Arc` so the REST layer, background
/// loops, and the chat orchestrator can all share one instance.
#[derive(Clone)]
pub struct Coordinator {
    /// Process-wide configuration.
    pub config: Arc<CoordinatorConfig>,
    /// Event bus (Component A).
    pub bus: Arc<EventBus>,
    /// Agent registry (Component C).
    pub registry: Arc<AgentRegistry>,
    /// Task delegator (Component D).
    pub delegator: Arc<TaskDelegator>,
    /// Result aggregator (Component E).
    pub aggregator: Arc<ResultAggregator>,
    /// Conflict resolver (Component F).
    pub conflict_resolver: Arc<ConflictResolver>,
    /// Pipeline controller (Component G).
    pub pipelines: Arc<PipelineController>,
    /// Communication manager (Component H).
    pub communication: Arc<CommunicationManager>,
    /// Realtime broadcaster (Component J).
    pub broadcaster: Arc<RealtimeBroadcaster>,
    /// Chat orchestrator (Component I).
    pub chat: Arc<ChatOrchestrator>,
    /// Marketplace collaborator, used directly by agents and background jobs.
    pub marketplace: Arc<dyn MarketplaceClient>,
    /// Conversation persistence, exposed so the REST layer can list/fetch history.
    pub conversations: Arc<SqliteConversationStore>,
    /// Agent status persistence.
    pub agent_store: Arc<SqliteAgentStore>,
    /// Task ledger persistence.
    pub task_store: Arc<SqliteTaskStore>,
    /// Decision/metric audit trail.
    pub telemetry: Arc<SqliteTelemetryStore>,
    /// Signals background loops to stop on shutdown.
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    /// Builds every component from `config`, opening (and migrating) the
    /// `SQLite` database and constructing the marketplace client from the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError` if the database cannot be opened/migrated.
    pub async fn build(config: CoordinatorConfig) -> CoordinatorResult<Self> {
        let db_path = DatabasePath::new(&config.storage_path)?;
        let db_config = DatabaseConfig::new(db_path);
        let connection = DatabaseConnection::initialize(db_config).await?;

        let time = production_time_provider();
        let bus = Arc::new(EventBus::new(config.bus_queue_capacity.into_inner(), Duration::from_millis(config.publish_block_timeout_ms.into_inner())));

        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&bus),
            Arc::clone(&time),
            Duration::from_secs(config.ping_after_idle_secs),
            Duration::from_secs(config.disconnect_after_idle_secs),
        ));

        let delegator = Arc::new(TaskDelegator::new(Arc::clone(&registry), Arc::clone(&bus), Arc::clone(&time)));
        let aggregator = Arc::new(ResultAggregator::new(Arc::clone(&bus)));
        let conflict_resolver = Arc::new(ConflictResolver::new(Arc::clone(&bus)));

        let communication = Arc::new(CommunicationManager::new(Arc::clone(&registry), Arc::clone(&bus)));
        let broadcaster = Arc::new(RealtimeBroadcaster::new(config.latency_ring_size.into_inner()));

        let pipelines = Arc::new(PipelineController::new(
            Arc::clone(&communication),
            Arc::clone(&broadcaster),
            Arc::clone(&time),
            Duration::from_millis(config.default_stage_timeout_ms.into_inner()),
            config.retry_backoff_base_secs.into_inner(),
        ));

        let conversations = Arc::new(SqliteConversationStore::new(connection.clone()));
        let agent_store = Arc::new(SqliteAgentStore::new(connection.clone()));
        let task_store = Arc::new(SqliteTaskStore::new(connection.clone()));
        let telemetry = Arc::new(SqliteTelemetryStore::new(connection.clone()));

        let llm: Arc<dyn LlmAdapter> = Arc::new(DeterministicLlmAdapter::default());
        let chat = Arc::new(ChatOrchestrator::new(
            conversations.clone(),
            Arc::clone(&registry),
            Arc::clone(&communication),
            Arc::clone(&broadcaster),
            Arc::clone(&pipelines),
            llm,
        ));

        let marketplace: Arc<dyn MarketplaceClient> = match MarketplaceCredentials::from_env() {
            Ok(credentials) => Arc::new(HttpMarketplaceClient::new(credentials, "https://sellingpartnerapi-na.amazon.com", &config.marketplace_rate_limits)),
            Err(error) => {
                tracing::warn!(%error, "marketplace credentials unavailable, agents calling the marketplace will fail");
                Arc::new(NullMarketplaceClient)
            }
        };

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            bus,
            registry,
            delegator,
            aggregator,
            conflict_resolver,
            pipelines,
            communication,
            broadcaster,
            chat,
            marketplace,
            conversations,
            agent_store,
            task_store,
            telemetry,
            shutdown_tx,
        })
    }

    /// Spawns the registry health-check loop and the delegator's
    /// deadline-monitor loop as background tasks.
    pub fn spawn_background_loops(&self) {
        let registry = Arc::clone(&self.registry);
        let rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_millis(self.config.health_check_interval_ms.into_inner());
        tokio::spawn(async move { registry.run_health_loop(interval, rx).await });

        let delegator = Arc::clone(&self.delegator);
        let rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_millis(self.config.deadline_monitor_interval_ms.into_inner());
        tokio::spawn(async move { delegator.run_deadline_monitor(interval, rx).await });
    }

    /// Signals background loops to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Subscribes the recovery-snapshot stores to the bus events the
    /// registry and delegator already publish, so a persisted crash-recovery
    /// view stays current without the in-memory components knowing SQL
    /// exists. Fire-and-forget: a write failure is logged, never propagated.
    pub fn spawn_persistence_bridge(&self) {
        let registry = Arc::clone(&self.registry);
        let agent_store = Arc::clone(&self.agent_store);
        self.bus.subscribe(
            Filter::Name("agent_status_updated".to_string()),
            Arc::new(move |event: crate::bus::Event| {
                let registry = Arc::clone(&registry);
                let agent_store: Arc<SqliteAgentStore> = Arc::clone(&agent_store);
                Box::pin(async move {
                    let Some(agent_id) = event.payload.get("agent_id").and_then(serde_json::Value::as_str) else { return };
                    let Ok(uuid) = agent_id.parse::<uuid::Uuid>() else { return };
                    let Ok(id) = crate::domain_types::AgentId::try_from(uuid);
                    let Some(record) = registry.get(id) else { return };
                    let snapshot = AgentStatusRecord {
                        agent_id: id,
                        category: record.category,
                        name: record.name,
                        status: record.status,
                        last_seen: record.last_seen,
                        metadata: record.metadata,
                    };
                    if let Err(error) = agent_store.upsert(&snapshot).await {
                        tracing::warn!(%error, agent_id = %id, "failed to persist agent status snapshot");
                    }
                }) as futures::future::BoxFuture<'static, ()>
            }),
        );

        let delegator = Arc::clone(&self.delegator);
        let task_store = Arc::clone(&self.task_store);
        self.bus.subscribe(
            Filter::Name("task_status_changed".to_string()),
            Arc::new(move |event: crate::bus::Event| {
                let delegator = Arc::clone(&delegator);
                let task_store: Arc<SqliteTaskStore> = Arc::clone(&task_store);
                Box::pin(async move {
                    let Some(task_id) = event.payload.get("task_id").and_then(serde_json::Value::as_str) else { return };
                    let Ok(uuid) = task_id.parse::<uuid::Uuid>() else { return };
                    let Ok(id) = crate::domain_types::TaskId::try_from(uuid);
                    let Some(task) = delegator.get(id) else { return };
                    let snapshot = PersistedTaskRecord::from_task(&task);
                    if let Err(error) = task_store.upsert(&snapshot).await {
                        tracing::warn!(%error, task_id = %id, "failed to persist task snapshot");
                    }
                }) as futures::future::BoxFuture<'static, ()>
            }),
        );
    }
}

/// Stand-in used when marketplace credentials aren't configured (e.g. local
/// development): every call fails clearly instead of panicking at startup.
struct NullMarketplaceClient;

#[async_trait::async_trait]
impl MarketplaceClient for NullMarketplaceClient {
    async fn call(
        &self,
        _category: crate::marketplace::MarketplaceCategory,
        _endpoint: &str,
        _method: &str,
        _params: std::collections::HashMap<String, String>,
        _body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, crate::marketplace::MarketplaceError> {
        Err(crate::marketplace::MarketplaceError::MissingEnv("LWA_APP_ID".to_string()))
    }
}
