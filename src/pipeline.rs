//! Dynamic pipeline execution over ordered/parallel stage graphs.
//!
//! Stage dispatch reuses the registry's fewest-active-tasks selection
//! policy (see `registry::AgentRegistry::select_least_loaded_in_category`)
//! and the communication manager's `send` for the actual agent call, the
//! same layering the message router uses between its `AgentRegistry` and
//! `DeliveryEngine` traits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::communication::{CommunicationManager, CommunicationError};
use crate::domain_types::{AgentCategory, ExecutionId};
use crate::realtime::RealtimeBroadcaster;
use crate::time_provider::SharedClock;

/// One stage in a pipeline's execution graph.
#[derive(Debug, Clone)]
pub struct Stage {
    /// Unique id within the owning pipeline.
    pub id: String,
    /// Agent category this stage dispatches to.
    pub category: AgentCategory,
    /// Whether failure of this stage aborts the whole pipeline run.
    pub required: bool,
    /// Per-stage timeout; falls back to the pipeline's default if `None`.
    pub timeout: Option<Duration>,
    /// Maximum retry attempts on timeout.
    pub retry_count: u32,
    /// Stage id to try if this stage exhausts its retries.
    pub fallback: Option<String>,
    /// Command name dispatched to the selected agent for this stage.
    pub command: String,
}

impl Stage {
    /// Convenience constructor for a plain, non-required stage with no fallback.
    #[must_use]
    pub fn new(id: impl Into<String>, category: AgentCategory, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category,
            required: true,
            timeout: None,
            retry_count: 0,
            fallback: None,
            command: command.into(),
        }
    }

    /// Marks the stage optional, builder-style.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Sets the fallback stage id, builder-style.
    #[must_use]
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    /// Sets retry count, builder-style.
    #[must_use]
    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Sets the per-stage timeout, builder-style.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Per-stage rolling execution metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageMetrics {
    /// Total execution attempts.
    pub executions: u64,
    /// Successful completions.
    pub successes: u64,
    /// Failures (after exhausting retries/fallback).
    pub failures: u64,
    /// Timeouts observed (counted independently of the eventual outcome).
    pub timeouts: u64,
    /// Retry attempts issued.
    pub retries: u64,
    /// Rolling average execution time in milliseconds.
    pub average_duration_ms: f64,
}

impl StageMetrics {
    fn record(&mut self, duration: Duration, outcome: StageOutcome) {
        self.executions += 1;
        let duration_ms = duration.as_secs_f64() * 1000.0;
        self.average_duration_ms += (duration_ms - self.average_duration_ms) / self.executions as f64;
        match outcome {
            StageOutcome::Success => self.successes += 1,
            StageOutcome::Failure => self.failures += 1,
        }
    }
}

enum StageOutcome {
    Success,
    Failure,
}

/// A named, ordered stage graph.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    /// Unique id.
    pub id: String,
    /// Human readable description.
    pub description: String,
    /// Ordered stages.
    pub stages: Vec<Stage>,
    /// When greater than 1, stages are batched into groups of this size and
    /// run concurrently within each batch.
    pub max_parallel_stages: usize,
}

impl PipelineDefinition {
    /// Creates a strictly sequential pipeline definition.
    #[must_use]
    pub fn sequential(id: impl Into<String>, description: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            stages,
            max_parallel_stages: 1,
        }
    }
}

/// Errors raised by pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No pipeline (or template) registered under this id.
    #[error("pipeline not found: {0}")]
    NotFound(String),
    /// A stage's configured fallback id does not exist in the same pipeline.
    #[error("stage {stage} references unknown fallback {fallback}")]
    UnknownFallback {
        /// Stage that declared the bad fallback.
        stage: String,
        /// The missing fallback id.
        fallback: String,
    },
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunResult {
    /// Execution id for this run.
    pub execution_id: ExecutionId,
    /// Whether the run succeeded (no required stage failed unrecoverably).
    pub success: bool,
    /// Final merged result data.
    pub result_data: Value,
    /// Stages that completed successfully.
    pub stages_completed: u64,
    /// Stages that failed.
    pub stages_failed: u64,
}

/// A snapshot of one pipeline run's live state, persisted on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStateSnapshot {
    /// Execution id.
    pub execution_id: ExecutionId,
    /// Wall-clock time the run started.
    pub start_time: SystemTime,
    /// Id of the pipeline definition being run.
    pub pipeline_id: String,
    /// Id of the stage currently executing, if any.
    pub current_stage: Option<String>,
    /// Count of stages completed so far.
    pub stages_completed: u64,
    /// Count of stages failed so far.
    pub stages_failed: u64,
    /// Rolling merged result data.
    pub result_data: Value,
    /// Per-participant responses keyed by agent id string.
    pub agent_responses: HashMap<String, Value>,
    /// `"running" | "completed" | "failed"`.
    pub status: String,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
}

/// Executes registered/templated pipelines over agent categories.
pub struct PipelineController {
    templates: DashMap<String, PipelineDefinition>,
    pipelines: DashMap<String, PipelineDefinition>,
    stage_metrics: DashMap<(String, String), StageMetrics>,
    active_executions: DashMap<ExecutionId, WorkflowStateSnapshot>,
    communication: Arc<CommunicationManager>,
    broadcaster: Arc<RealtimeBroadcaster>,
    time: SharedClock,
    default_stage_timeout: Duration,
    retry_backoff_base_secs: f64,
}

impl PipelineController {
    /// Creates a controller with the four default templates registered:
    /// `pricing_update`, `inventory_sync`, `content_generation`,
    /// `full_marketplace_cycle`.
    #[must_use]
    pub fn new(
        communication: Arc<CommunicationManager>,
        broadcaster: Arc<RealtimeBroadcaster>,
        time: SharedClock,
        default_stage_timeout: Duration,
        retry_backoff_base_secs: f64,
    ) -> Self {
        let controller = Self {
            templates: DashMap::new(),
            pipelines: DashMap::new(),
            stage_metrics: DashMap::new(),
            active_executions: DashMap::new(),
            communication,
            broadcaster,
            time,
            default_stage_timeout,
            retry_backoff_base_secs,
        };
        controller.register_default_templates();
        controller
    }

    fn register_default_templates(&self) {
        self.templates.insert(
            "pricing_update".to_string(),
            PipelineDefinition::sequential(
                "pricing_update",
                "executive review then market reprice",
                vec![
                    Stage::new("executive_review", AgentCategory::Executive, "review_pricing"),
                    Stage::new("market_reprice", AgentCategory::Market, "apply_pricing"),
                ],
            ),
        );
        self.templates.insert(
            "inventory_sync".to_string(),
            PipelineDefinition::sequential(
                "inventory_sync",
                "executive approval, market check, logistics sync",
                vec![
                    Stage::new("executive_approval", AgentCategory::Executive, "approve_sync"),
                    Stage::new("market_check", AgentCategory::Market, "check_inventory"),
                    Stage::new("logistics_sync", AgentCategory::Logistics, "sync_inventory"),
                ],
            ),
        );
        self.templates.insert(
            "content_generation".to_string(),
            PipelineDefinition::sequential(
                "content_generation",
                "executive brief, content draft, optional market review",
                vec![
                    Stage::new("executive_brief", AgentCategory::Executive, "brief_content"),
                    Stage::new("content_draft", AgentCategory::Content, "generate_content"),
                    Stage::new("market_review", AgentCategory::Market, "review_content").optional(),
                ],
            ),
        );
        self.templates.insert(
            "full_marketplace_cycle".to_string(),
            PipelineDefinition {
                id: "full_marketplace_cycle".to_string(),
                description: "executive, content, market, logistics end-to-end".to_string(),
                stages: vec![
                    Stage::new("executive_plan", AgentCategory::Executive, "plan_cycle"),
                    Stage::new("content_update", AgentCategory::Content, "update_content"),
                    Stage::new("market_update", AgentCategory::Market, "update_market"),
                    Stage::new("logistics_update", AgentCategory::Logistics, "update_logistics"),
                ],
                max_parallel_stages: 2,
            },
        );
    }

    /// Registers (or replaces) a named template.
    pub fn register_template(&self, definition: PipelineDefinition) {
        self.templates.insert(definition.id.clone(), definition);
    }

    /// Instantiates a new pipeline from a template, with an optional
    /// stage-timeout override applied uniformly.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NotFound` if `template_id` is unknown.
    pub fn create_from_template(
        &self,
        template_id: &str,
        new_id: impl Into<String>,
    ) -> Result<(), PipelineError> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| PipelineError::NotFound(template_id.to_string()))?
            .clone();
        let mut instance = template;
        instance.id = new_id.into();
        self.register_pipeline(instance)
    }

    /// Registers a fully custom pipeline, validating that every stage's
    /// fallback (if any) refers to another stage in the same pipeline.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::UnknownFallback` if a fallback id is dangling.
    pub fn register_pipeline(&self, definition: PipelineDefinition) -> Result<(), PipelineError> {
        let stage_ids: std::collections::HashSet<&str> = definition.stages.iter().map(|s| s.id.as_str()).collect();
        for stage in &definition.stages {
            if let Some(fallback) = &stage.fallback {
                if !stage_ids.contains(fallback.as_str()) {
                    return Err(PipelineError::UnknownFallback {
                        stage: stage.id.clone(),
                        fallback: fallback.clone(),
                    });
                }
            }
        }
        self.pipelines.insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Runs `pipeline_id` to completion (or first unrecoverable failure),
    /// merging each stage's output into a rolling result map and persisting
    /// a snapshot after every transition.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::NotFound` if `pipeline_id` is unregistered.
    #[instrument(skip(self, input_data))]
    pub async fn execute(
        &self,
        pipeline_id: &str,
        input_data: Value,
        execution_id: Option<ExecutionId>,
    ) -> Result<PipelineRunResult, PipelineError> {
        let definition = self
            .pipelines
            .get(pipeline_id)
            .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))?
            .clone();

        let execution_id = execution_id.unwrap_or_else(ExecutionId::generate);
        let mut snapshot = WorkflowStateSnapshot {
            execution_id,
            start_time: self.time.now(),
            pipeline_id: pipeline_id.to_string(),
            current_stage: None,
            stages_completed: 0,
            stages_failed: 0,
            result_data: input_data,
            agent_responses: HashMap::new(),
            status: "running".to_string(),
            progress: 0.0,
        };
        self.persist_snapshot(&snapshot).await;

        let total_stages = definition.stages.len().max(1);
        let mut aborted = false;

        if definition.max_parallel_stages > 1 {
            for batch in definition.stages.chunks(definition.max_parallel_stages) {
                let mut batch_results: Vec<(String, Result<Value, ()>)> = Vec::new();
                for stage in batch {
                    let outcome = self.run_stage_with_recovery(stage, &definition, &snapshot.result_data).await;
                    batch_results.push((stage.id.clone(), outcome));
                }
                let mut batch_failed_required = false;
                for (stage_id, outcome) in batch_results {
                    let stage = batch.iter().find(|s| s.id == stage_id).expect("stage in its own batch");
                    match outcome {
                        Ok(value) => {
                            merge_into(&mut snapshot.result_data, &value);
                            snapshot.stages_completed += 1;
                        }
                        Err(()) => {
                            snapshot.stages_failed += 1;
                            if stage.required {
                                batch_failed_required = true;
                            }
                        }
                    }
                }
                snapshot.progress = (snapshot.stages_completed + snapshot.stages_failed) as f64 / total_stages as f64;
                self.persist_snapshot(&snapshot).await;
                if batch_failed_required {
                    aborted = true;
                    break;
                }
            }
        } else {
            for stage in &definition.stages {
                snapshot.current_stage = Some(stage.id.clone());
                self.persist_snapshot(&snapshot).await;

                let outcome = self.run_stage_with_recovery(stage, &definition, &snapshot.result_data).await;
                match outcome {
                    Ok(value) => {
                        merge_into(&mut snapshot.result_data, &value);
                        snapshot.stages_completed += 1;
                    }
                    Err(()) => {
                        snapshot.stages_failed += 1;
                        if stage.required {
                            aborted = true;
                            snapshot.progress = (snapshot.stages_completed + snapshot.stages_failed) as f64 / total_stages as f64;
                            self.persist_snapshot(&snapshot).await;
                            break;
                        }
                    }
                }
                snapshot.progress = (snapshot.stages_completed + snapshot.stages_failed) as f64 / total_stages as f64;
                self.persist_snapshot(&snapshot).await;
            }
        }

        snapshot.current_stage = None;
        snapshot.status = if aborted { "failed".to_string() } else { "completed".to_string() };
        snapshot.progress = 1.0_f64.min(snapshot.progress.max(if aborted { snapshot.progress } else { 1.0 }));
        self.persist_snapshot(&snapshot).await;
        self.active_executions.remove(&execution_id);

        Ok(PipelineRunResult {
            execution_id,
            success: !aborted,
            result_data: snapshot.result_data,
            stages_completed: snapshot.stages_completed,
            stages_failed: snapshot.stages_failed,
        })
    }

    async fn run_stage_with_recovery(
        &self,
        stage: &Stage,
        definition: &PipelineDefinition,
        context: &Value,
    ) -> Result<Value, ()> {
        match self.run_stage(stage, context).await {
            Ok(value) => Ok(value),
            Err(()) => {
                if let Some(fallback_id) = &stage.fallback {
                    if let Some(fallback) = definition.stages.iter().find(|s| &s.id == fallback_id) {
                        warn!(stage = %stage.id, fallback = %fallback_id, "stage failed, trying fallback");
                        return self.run_stage(fallback, context).await;
                    }
                }
                Err(())
            }
        }
    }

    async fn run_stage(&self, stage: &Stage, context: &Value) -> Result<Value, ()> {
        let timeout = stage.timeout.unwrap_or(self.default_stage_timeout);
        let mut attempt = 0u32;
        loop {
            let started = self.time.instant();
            let result = tokio::time::timeout(
                timeout,
                self.communication.dispatch_to_category(stage.category, &stage.command, context.clone()),
            )
            .await;
            let elapsed = started.elapsed();

            match result {
                Ok(Ok(response)) => {
                    self.record_stage_metrics(stage, elapsed, StageOutcome::Success);
                    return Ok(response);
                }
                Ok(Err(CommunicationError::NoEligibleAgent)) | Err(_) => {
                    self.increment_timeout(stage);
                    if attempt >= stage.retry_count {
                        self.record_stage_metrics(stage, elapsed, StageOutcome::Failure);
                        return Err(());
                    }
                    attempt += 1;
                    self.increment_retry(stage);
                    let backoff = Duration::from_secs_f64(self.retry_backoff_base_secs.powi(attempt as i32));
                    self.time.sleep(backoff).await;
                }
                Ok(Err(_other)) => {
                    self.record_stage_metrics(stage, elapsed, StageOutcome::Failure);
                    return Err(());
                }
            }
        }
    }

    fn record_stage_metrics(&self, stage: &Stage, duration: Duration, outcome: StageOutcome) {
        let key = (stage.id.clone(), stage.command.clone());
        self.stage_metrics.entry(key).or_default().record(duration, outcome);
    }

    fn increment_timeout(&self, stage: &Stage) {
        let key = (stage.id.clone(), stage.command.clone());
        self.stage_metrics.entry(key).or_default().timeouts += 1;
    }

    fn increment_retry(&self, stage: &Stage) {
        let key = (stage.id.clone(), stage.command.clone());
        self.stage_metrics.entry(key).or_default().retries += 1;
    }

    /// Current metrics for one stage, keyed by (stage id, command).
    #[must_use]
    pub fn stage_metrics(&self, stage_id: &str, command: &str) -> Option<StageMetrics> {
        self.stage_metrics
            .get(&(stage_id.to_string(), command.to_string()))
            .map(|entry| entry.clone())
    }

    async fn persist_snapshot(&self, snapshot: &WorkflowStateSnapshot) {
        self.active_executions.insert(snapshot.execution_id, snapshot.clone());
        self.broadcaster
            .broadcast_workflow_update(
                snapshot.execution_id,
                "workflow_update",
                &snapshot.status,
                snapshot.progress,
                snapshot.agent_responses.keys().cloned().collect(),
                snapshot.current_stage.clone(),
                None,
            )
            .await;
    }
}

fn merge_into(target: &mut Value, addition: &Value) {
    if let (Value::Object(target_map), Value::Object(addition_map)) = (target, addition) {
        for (key, value) in addition_map {
            target_map.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::registry::AgentRegistry;
    use crate::time_provider::test_time_provider;

    fn harness() -> (Arc<AgentRegistry>, Arc<CommunicationManager>, PipelineController) {
        let bus = Arc::new(EventBus::new(64, Duration::from_millis(100)));
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&bus),
            test_time_provider(),
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        let communication = Arc::new(CommunicationManager::new(Arc::clone(&registry), Arc::clone(&bus)));
        let broadcaster = Arc::new(RealtimeBroadcaster::new(1024));
        let controller = PipelineController::new(
            communication.clone(),
            broadcaster,
            test_time_provider(),
            Duration::from_millis(50),
            2.0,
        );
        (registry, communication, controller)
    }

    #[tokio::test]
    async fn default_templates_are_registered() {
        let (_, _, controller) = harness();
        assert!(controller.templates.contains_key("pricing_update"));
        assert!(controller.templates.contains_key("full_marketplace_cycle"));
    }

    #[tokio::test]
    async fn pipeline_with_no_agents_available_fails_required_stage() {
        let (_, _, controller) = harness();
        controller.create_from_template("pricing_update", "run1").unwrap();

        let result = controller.execute("run1", serde_json::json!({}), None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.stages_failed, 1);
    }

    #[tokio::test]
    async fn registering_pipeline_with_dangling_fallback_is_rejected() {
        let (_, _, controller) = harness();
        let stages = vec![Stage::new("a", AgentCategory::Market, "x").with_fallback("missing")];
        let err = controller
            .register_pipeline(PipelineDefinition::sequential("bad", "bad", stages))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownFallback { .. }));
    }

    #[tokio::test]
    async fn optional_stage_failure_does_not_abort_pipeline() {
        let (_, _, controller) = harness();
        let stages = vec![Stage::new("opt", AgentCategory::Logistics, "sync_inventory").optional()];
        controller
            .register_pipeline(PipelineDefinition::sequential("optional_only", "optional_only", stages))
            .unwrap();

        let result = controller.execute("optional_only", serde_json::json!({}), None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.stages_failed, 1);
        assert_eq!(result.stages_completed, 0);
    }
}
