//! Task delegation: lifecycle state machine, parent/subtask rollup,
//! deadline monitoring and capability-based assignment.
//!
//! The lifecycle transition function follows the pure
//! `State x Event -> Result<State, Err>` shape used by
//! `domain::agent_lifecycle::AgentLifecycle::transition_to` in the
//! reference platform: transitions are computed without side effects and
//! applied under the delegator's single lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::bus::{Event, EventBus};
use crate::domain_types::{AgentId, Capability, Priority, TaskId};
use crate::registry::AgentRegistry;
use crate::time_provider::SharedClock;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    /// Created, not yet assigned to an agent.
    Created,
    /// Assigned to an agent, awaiting acceptance.
    Assigned,
    /// Accepted by the assigned agent but not yet actively worked.
    Accepted,
    /// Actively being worked.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Forced terminal by the deadline monitor.
    Timeout,
}

impl TaskStatus {
    /// Whether this status can never transition further.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout)
    }

    /// Whether this status counts as "active" for load-balancing.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Assigned | Self::Accepted | Self::Processing)
    }
}

/// A transition event applied to a task's lifecycle.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Assign the task to an agent.
    Assign(AgentId),
    /// The assigned agent accepted the task.
    Accept,
    /// The assigned agent began active processing.
    StartProcessing,
    /// The task completed with a result.
    Complete(Value),
    /// The task failed with an error description.
    Fail(String),
    /// The task was cancelled.
    Cancel,
    /// The deadline monitor forced a timeout.
    TimedOut,
}

/// Errors raised applying a task lifecycle transition.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    /// The event is not valid from the task's current status.
    #[error("cannot apply {event:?} to task in {status:?}")]
    InvalidTransition {
        /// The status the task was in.
        status: TaskStatus,
        /// The event that was rejected.
        event: String,
    },
    /// The task was already in a terminal status.
    #[error("task already terminal: {0:?}")]
    TerminalState(TaskStatus),
}

/// Pure state machine: computes the next status for `(status, event)`
/// without mutating anything. Terminal statuses reject every event.
///
/// # Errors
///
/// Returns `StateTransitionError` if the event is not legal from `status`.
pub fn transition(status: TaskStatus, event: &TaskEvent) -> Result<TaskStatus, StateTransitionError> {
    if status.is_terminal() {
        return Err(StateTransitionError::TerminalState(status));
    }
    let next = match (status, event) {
        (TaskStatus::Created, TaskEvent::Assign(_)) => TaskStatus::Assigned,
        (TaskStatus::Assigned, TaskEvent::Accept) => TaskStatus::Accepted,
        (TaskStatus::Accepted, TaskEvent::StartProcessing) => TaskStatus::Processing,
        (TaskStatus::Assigned | TaskStatus::Accepted | TaskStatus::Processing, TaskEvent::Complete(_)) => {
            TaskStatus::Completed
        }
        (TaskStatus::Assigned | TaskStatus::Accepted | TaskStatus::Processing, TaskEvent::Fail(_)) => {
            TaskStatus::Failed
        }
        (_, TaskEvent::Cancel) => TaskStatus::Cancelled,
        (_, TaskEvent::TimedOut) => TaskStatus::Timeout,
        _ => {
            return Err(StateTransitionError::InvalidTransition {
                status,
                event: format!("{event:?}"),
            });
        }
    };
    Ok(next)
}

/// A task record, including its place in a parent/subtask graph.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Unique id.
    pub id: TaskId,
    /// Application-defined task type.
    pub task_type: String,
    /// Task parameters.
    pub parameters: HashMap<String, Value>,
    /// Currently assigned agent, if any.
    pub assigned_agent: Option<AgentId>,
    /// Parent task id, if this is a subtask.
    pub parent_id: Option<TaskId>,
    /// Priority, used for assignment tie-breaking and bus priority mapping.
    pub priority: Priority,
    /// Optional deadline; past this instant while active the task is forced to Timeout.
    pub deadline: Option<SystemTime>,
    /// Arbitrary metadata.
    pub metadata: HashMap<String, Value>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// Timestamps for each transition actually observed, most recent last.
    pub transitioned_at: Vec<(TaskStatus, SystemTime)>,
    /// Result payload once Completed.
    pub result: Option<Value>,
    /// Error description once Failed.
    pub error: Option<String>,
    /// Ordered subtask ids, populated by `decompose`.
    pub subtasks: Vec<TaskId>,
    /// Subtask ids that have reached a terminal state.
    pub completed_subtasks: std::collections::HashSet<TaskId>,
}

impl Task {
    fn new(task_type: impl Into<String>, parameters: HashMap<String, Value>, parent_id: Option<TaskId>, priority: Priority, deadline: Option<SystemTime>, created_at: SystemTime) -> Self {
        Self {
            id: TaskId::generate(),
            task_type: task_type.into(),
            parameters,
            assigned_agent: None,
            parent_id,
            priority,
            deadline,
            metadata: HashMap::new(),
            status: TaskStatus::Created,
            created_at,
            transitioned_at: Vec::new(),
            result: None,
            error: None,
            subtasks: Vec::new(),
            completed_subtasks: std::collections::HashSet::new(),
        }
    }
}

/// Errors raised by delegation operations.
#[derive(Debug, Error)]
pub enum DelegationError {
    /// No such task.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// A requested transition was illegal.
    #[error(transparent)]
    Transition(#[from] StateTransitionError),
    /// Neither a target agent nor a required capability was given to `delegate`.
    #[error("delegate requires either a target agent or a required capability")]
    NoSelectionCriteria,
    /// The explicitly targeted agent does not exist.
    #[error("target agent not registered: {0}")]
    TargetAgentNotRegistered(AgentId),
    /// The explicitly targeted agent cannot offer the required capability.
    #[error("target agent {agent} lacks required capability")]
    TargetAgentLacksCapability {
        /// The agent that was targeted.
        agent: AgentId,
    },
    /// No agent satisfying the required capability was available.
    #[error("no agent available for required capability")]
    NoEligibleAgent,
}

/// Task lifecycle manager with parent/subtask rollup and a deadline monitor.
pub struct TaskDelegator {
    tasks: DashMap<TaskId, Task>,
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    time: SharedClock,
}

impl TaskDelegator {
    /// Creates a new, empty delegator.
    #[must_use]
    pub fn new(registry: Arc<AgentRegistry>, bus: Arc<EventBus>, time: SharedClock) -> Self {
        Self {
            tasks: DashMap::new(),
            registry,
            bus,
            time,
        }
    }

    /// Creates a new task in `Created` status.
    pub fn create_task(
        &self,
        task_type: impl Into<String>,
        parameters: HashMap<String, Value>,
        parent_id: Option<TaskId>,
        priority: Priority,
        deadline: Option<SystemTime>,
    ) -> TaskId {
        let task = Task::new(task_type, parameters, parent_id, priority, deadline, self.time.now());
        let id = task.id;
        if let Some(parent) = parent_id {
            if let Some(mut parent_task) = self.tasks.get_mut(&parent) {
                parent_task.subtasks.push(id);
            }
        }
        self.tasks.insert(id, task);
        id
    }

    /// Decomposes `parent_id` into subtasks, returning their ids in order.
    ///
    /// # Errors
    ///
    /// Returns `DelegationError::TaskNotFound` if `parent_id` does not exist.
    pub fn decompose(
        &self,
        parent_id: TaskId,
        subtask_defs: Vec<(String, HashMap<String, Value>, Priority, Option<SystemTime>)>,
    ) -> Result<Vec<TaskId>, DelegationError> {
        if !self.tasks.contains_key(&parent_id) {
            return Err(DelegationError::TaskNotFound(parent_id));
        }
        let ids = subtask_defs
            .into_iter()
            .map(|(task_type, params, priority, deadline)| {
                self.create_task(task_type, params, Some(parent_id), priority, deadline)
            })
            .collect();
        Ok(ids)
    }

    /// Resolves a target agent for a delegation request per the assignment
    /// policy: explicit target (validated), else fewest-active-tasks among
    /// capability matches, tie-broken by id order.
    ///
    /// # Errors
    ///
    /// Returns `DelegationError` variants describing why no agent could be selected.
    pub fn resolve_assignment(
        &self,
        target_agent: Option<AgentId>,
        required_capability: Option<&Capability>,
    ) -> Result<AgentId, DelegationError> {
        if let Some(target) = target_agent {
            let record = self
                .registry
                .get(target)
                .ok_or(DelegationError::TargetAgentNotRegistered(target))?;
            if let Some(required) = required_capability {
                if !record.satisfies(required) {
                    return Err(DelegationError::TargetAgentLacksCapability { agent: target });
                }
            }
            return Ok(target);
        }

        if let Some(required) = required_capability {
            return self
                .registry
                .select_least_loaded(required)
                .ok_or(DelegationError::NoEligibleAgent);
        }

        Err(DelegationError::NoSelectionCriteria)
    }

    /// Creates a task and immediately assigns it per `resolve_assignment`.
    ///
    /// # Errors
    ///
    /// Propagates `DelegationError` from `resolve_assignment`.
    pub async fn delegate(
        &self,
        task_type: impl Into<String>,
        parameters: HashMap<String, Value>,
        target_agent: Option<AgentId>,
        required_capability: Option<&Capability>,
        priority: Priority,
        deadline: Option<SystemTime>,
    ) -> Result<TaskId, DelegationError> {
        let agent = self.resolve_assignment(target_agent, required_capability)?;
        let task_id = self.create_task(task_type, parameters, None, priority, deadline);
        self.assign(task_id, agent).await?;
        Ok(task_id)
    }

    /// Applies `event` to the task's lifecycle, persisting the new status
    /// and timestamp, then checks whether a parent rollup is triggered.
    ///
    /// # Errors
    ///
    /// Returns `DelegationError::TaskNotFound` or a transition error.
    #[instrument(skip(self))]
    pub async fn apply(&self, task_id: TaskId, event: TaskEvent) -> Result<TaskStatus, DelegationError> {
        let (new_status, parent_id, agent) = {
            let mut task = self.tasks.get_mut(&task_id).ok_or(DelegationError::TaskNotFound(task_id))?;
            let new_status = transition(task.status, &event)?;

            if let TaskEvent::Assign(agent) = &event {
                task.assigned_agent = Some(*agent);
            }
            match &event {
                TaskEvent::Complete(result) => task.result = Some(result.clone()),
                TaskEvent::Fail(error) => task.error = Some(error.clone()),
                _ => {}
            }
            task.status = new_status;
            task.transitioned_at.push((new_status, self.time.now()));
            (new_status, task.parent_id, task.assigned_agent)
        };

        if matches!(event, TaskEvent::Assign(_)) {
            if let Some(agent) = agent {
                self.registry.adjust_active_task_count(agent, 1);
            }
        }
        if new_status.is_terminal() {
            if let Some(agent) = agent {
                self.registry.adjust_active_task_count(agent, -1);
            }
        }

        let _ = self
            .bus
            .publish(Event::notification(
                "task_status_changed",
                "task_delegator",
                serde_json::json!({ "task_id": task_id.to_string(), "status": format!("{new_status:?}") }),
            ))
            .await;

        if new_status.is_terminal() {
            if let Some(parent_id) = parent_id {
                self.roll_up_parent(parent_id).await;
            }
        }

        Ok(new_status)
    }

    /// Marks a subtask as accounted for in its parent and, if every subtask
    /// is now terminal, applies the parent completion rule from the data
    /// model: all-completed rolls the parent up with a merged result map;
    /// any failure fails the parent.
    async fn roll_up_parent(&self, parent_id: TaskId) {
        let (all_terminal, all_completed, child_results) = {
            let Some(mut parent) = self.tasks.get_mut(&parent_id) else { return };
            if parent.status.is_terminal() {
                return;
            }
            let mut all_terminal = true;
            let mut all_completed = true;
            let mut results = serde_json::Map::new();
            for subtask_id in parent.subtasks.clone() {
                let Some(sub) = self.tasks.get(&subtask_id) else { continue };
                if sub.status.is_terminal() {
                    parent.completed_subtasks.insert(subtask_id);
                    if sub.status != TaskStatus::Completed {
                        all_completed = false;
                    }
                    if let Some(result) = &sub.result {
                        results.insert(subtask_id.to_string(), result.clone());
                    }
                } else {
                    all_terminal = false;
                }
            }
            (all_terminal, all_completed, Value::Object(results))
        };

        if !all_terminal {
            return;
        }

        let event = if all_completed {
            TaskEvent::Complete(child_results)
        } else {
            TaskEvent::Fail("one or more subtasks failed".to_string())
        };

        // Parent rollup re-enters `apply`, which will itself re-check the
        // grandparent chain if this parent is in turn a subtask.
        let _ = Box::pin(self.apply(parent_id, event)).await;
    }

    /// Assigns `task_id` to `agent`.
    ///
    /// # Errors
    ///
    /// Propagates transition errors from `apply`.
    pub async fn assign(&self, task_id: TaskId, agent: AgentId) -> Result<(), DelegationError> {
        self.apply(task_id, TaskEvent::Assign(agent)).await?;
        Ok(())
    }

    /// Cancels a task; recursively cancels non-terminal subtasks.
    /// Cancelling an already-terminal task is a no-op returning `false`.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        let Some(task) = self.get(task_id) else { return false };
        if task.status.is_terminal() {
            return false;
        }
        for subtask_id in task.subtasks.clone() {
            Box::pin(self.cancel(subtask_id)).await;
        }
        self.apply(task_id, TaskEvent::Cancel).await.is_ok()
    }

    /// Fetches a snapshot of a task.
    #[must_use]
    pub fn get(&self, task_id: TaskId) -> Option<Task> {
        self.tasks.get(&task_id).map(|entry| entry.value().clone())
    }

    /// All subtasks of `parent_id`.
    #[must_use]
    pub fn subtasks_of(&self, parent_id: TaskId) -> Vec<Task> {
        self.get(parent_id)
            .map(|parent| parent.subtasks.iter().filter_map(|id| self.get(*id)).collect())
            .unwrap_or_default()
    }

    /// Tasks currently assigned to `agent`, optionally filtered by status.
    #[must_use]
    pub fn tasks_for(&self, agent: AgentId, status: Option<TaskStatus>) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|entry| entry.value().assigned_agent == Some(agent))
            .filter(|entry| status.is_none_or(|s| entry.value().status == s))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Forces every active task past its deadline into `Timeout`.
    #[instrument(skip(self))]
    pub async fn run_deadline_sweep(&self) {
        let now = self.time.now();
        let overdue: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| {
                let task = entry.value();
                !task.status.is_terminal() && task.deadline.is_some_and(|deadline| deadline <= now)
            })
            .map(|entry| *entry.key())
            .collect();

        for task_id in overdue {
            warn!(task_id = %task_id, "task exceeded deadline");
            let _ = self.apply(task_id, TaskEvent::TimedOut).await;
        }
    }

    /// Runs the deadline monitor loop until `shutdown` resolves.
    pub async fn run_deadline_monitor(self: Arc<Self>, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                () = self.time.sleep(interval) => {
                    self.run_deadline_sweep().await;
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
    use crate::domain_types::AgentCategory;
    use crate::registry::AgentRecord;
    use crate::time_provider::test_time_provider;

    fn harness() -> (Arc<AgentRegistry>, Arc<EventBus>, TaskDelegator) {
        let bus = Arc::new(EventBus::new(64, Duration::from_millis(100)));
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&bus),
            test_time_provider(),
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        let delegator = TaskDelegator::new(Arc::clone(&registry), Arc::clone(&bus), test_time_provider());
        (registry, bus, delegator)
    }

    #[tokio::test]
    async fn parent_completes_when_all_subtasks_complete() {
        let (_, _, delegator) = harness();
        let parent = delegator.create_task("rollup_test", HashMap::new(), None, Priority::Normal, None);
        let subtasks = delegator
            .decompose(
                parent,
                vec![
                    ("s1".into(), HashMap::new(), Priority::Normal, None),
                    ("s2".into(), HashMap::new(), Priority::Normal, None),
                    ("s3".into(), HashMap::new(), Priority::Normal, None),
                ],
            )
            .unwrap();

        let agent = AgentId::generate();
        for (i, sub) in subtasks.iter().enumerate() {
            delegator.apply(*sub, TaskEvent::Assign(agent)).await.unwrap();
            delegator
                .apply(*sub, TaskEvent::Complete(serde_json::json!(format!("result-{i}"))))
                .await
                .unwrap();
        }

        let parent_task = delegator.get(parent).unwrap();
        assert_eq!(parent_task.status, TaskStatus::Completed);
        assert_eq!(parent_task.result.unwrap().as_object().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn parent_fails_if_any_subtask_fails() {
        let (_, _, delegator) = harness();
        let parent = delegator.create_task("rollup_test", HashMap::new(), None, Priority::Normal, None);
        let subtasks = delegator
            .decompose(
                parent,
                vec![
                    ("s1".into(), HashMap::new(), Priority::Normal, None),
                    ("s2".into(), HashMap::new(), Priority::Normal, None),
                ],
            )
            .unwrap();

        delegator.apply(subtasks[0], TaskEvent::Assign(AgentId::generate())).await.unwrap();
        delegator.apply(subtasks[0], TaskEvent::Complete(serde_json::json!("ok"))).await.unwrap();
        delegator.apply(subtasks[1], TaskEvent::Assign(AgentId::generate())).await.unwrap();
        delegator.apply(subtasks[1], TaskEvent::Fail("boom".into())).await.unwrap();

        let parent_task = delegator.get(parent).unwrap();
        assert_eq!(parent_task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_task() {
        let (_, _, delegator) = harness();
        let task = delegator.create_task("t", HashMap::new(), None, Priority::Normal, None);
        delegator.apply(task, TaskEvent::Assign(AgentId::generate())).await.unwrap();
        delegator.apply(task, TaskEvent::Complete(serde_json::json!("done"))).await.unwrap();

        assert!(!delegator.cancel(task).await);
    }

    #[tokio::test]
    async fn cancel_recursively_cancels_subtasks() {
        let (_, _, delegator) = harness();
        let parent = delegator.create_task("p", HashMap::new(), None, Priority::Normal, None);
        let subtasks = delegator
            .decompose(parent, vec![("s1".into(), HashMap::new(), Priority::Normal, None)])
            .unwrap();

        assert!(delegator.cancel(parent).await);
        assert_eq!(delegator.get(subtasks[0]).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn deadline_sweep_times_out_overdue_active_tasks() {
        let (_, _, delegator) = harness();
        let past = SystemTime::now() - Duration::from_secs(10);
        let task = delegator.create_task("t", HashMap::new(), None, Priority::Normal, Some(past));
        delegator.apply(task, TaskEvent::Assign(AgentId::generate())).await.unwrap();

        delegator.run_deadline_sweep().await;
        assert_eq!(delegator.get(task).unwrap().status, TaskStatus::Timeout);
    }

    #[tokio::test]
    async fn assignment_policy_picks_least_loaded_capability_match() {
        let (registry, _, delegator) = harness();
        let cap = Capability::named("market_data");
        let mut ids = vec![AgentId::generate(), AgentId::generate()];
        ids.sort_by_key(ToString::to_string);
        for id in &ids {
            registry
                .register(AgentRecord::new(*id, AgentCategory::Market, "m", "", vec![cap.clone()]))
                .unwrap();
        }
        registry.adjust_active_task_count(ids[0], 5);

        let task = delegator
            .delegate("t", HashMap::new(), None, Some(&cap), Priority::Normal, None)
            .await
            .unwrap();
        assert_eq!(delegator.get(task).unwrap().assigned_agent, Some(ids[1]));
    }

    #[test]
    fn transition_rejects_events_on_terminal_states() {
        let err = transition(TaskStatus::Completed, &TaskEvent::Cancel).unwrap_err();
        assert!(matches!(err, StateTransitionError::TerminalState(TaskStatus::Completed)));
    }
}
