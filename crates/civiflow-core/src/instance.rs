//! Workflow instances and the per-task state machine
//!
//! An instance is one execution of a DAG for one request. It owns an
//! isolated [`Context`] and a table of per-task states; the instance
//! status is *derived* from that table and never assigned independently,
//! so there is exactly one writer of truth for "where is this instance".

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::Context;
use crate::dag::Dag;
use crate::event::Event;

/// Status of one task within one instance
///
/// ```text
/// pending → ready → executing → { completed | waiting | retry | skipped | failed }
/// ```
///
/// `waiting` and `retry` re-enter `ready` (on input / timed wake); the
/// rest are terminal except through cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Executing,
    Completed,
    Waiting,
    Retry,
    Skipped,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status ends the task for good
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Skipped | Self::Failed | Self::Cancelled
        )
    }

    /// Whether downstream tasks may treat this upstream as satisfied
    pub fn satisfies_downstream(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Waiting => "waiting",
            Self::Retry => "retry",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Per-(instance, task) execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,

    /// Output map, written exactly once, at the transition into `Completed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Map<String, Value>>,

    /// Copy of the externally delivered input, captured at delivery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_snapshot: Option<Value>,

    /// User or team a human task is assigned to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,

    /// Kind of external input a `Waiting` task expects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_for: Option<String>,

    /// Monotonically increasing attempt counter
    pub attempt_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// When the task first returned `Waiting`; the timeout clock. Set
    /// once and never reset by later `Waiting` results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_waiting_at: Option<DateTime<Utc>>,

    /// Earliest time a parked task may be re-dispatched (timed wake)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_eligible_at: Option<DateTime<Utc>>,

    /// Operator-controlled scratch space
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            output: None,
            input_snapshot: None,
            assigned_to: None,
            waiting_for: None,
            attempt_count: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            first_waiting_at: None,
            next_eligible_at: None,
            metadata: Map::new(),
        }
    }
}

/// Derived status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Whether the instance has reached a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// Derive the instance status from its task-state table
///
/// This function is the sole authority on instance status; no code
/// assigns a status that disagrees with it.
pub fn derive_status(task_states: &HashMap<String, TaskState>) -> InstanceStatus {
    let statuses = || task_states.values().map(|s| s.status);

    if statuses().any(|s| s == TaskStatus::Failed) {
        return InstanceStatus::Failed;
    }
    if statuses().any(|s| s == TaskStatus::Cancelled) {
        return InstanceStatus::Cancelled;
    }
    if statuses().all(|s| s.satisfies_downstream()) {
        return InstanceStatus::Completed;
    }
    // Retry counts as schedulable work: the engine re-readies it without
    // any external input.
    if statuses().any(|s| {
        matches!(
            s,
            TaskStatus::Ready | TaskStatus::Executing | TaskStatus::Retry
        )
    }) {
        return InstanceStatus::Running;
    }
    if statuses().any(|s| s == TaskStatus::Waiting) {
        return InstanceStatus::Paused;
    }
    InstanceStatus::Pending
}

/// One concrete execution of a DAG
///
/// The persisted shape is exactly this struct (context and task states as
/// JSON); stores save and load it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: Uuid,
    pub dag_id: String,
    pub owner_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub status: InstanceStatus,
    pub context: Context,
    pub task_states: HashMap<String, TaskState>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when this instance was created by a hook
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggering_event: Option<Event>,
    /// Hook-chain depth from the root instance (0 for API-created)
    #[serde(default)]
    pub hook_depth: u32,
}

impl Instance {
    /// Create a fresh instance of a DAG with every task `Pending`
    pub fn new(dag: &Dag, owner_user_id: impl Into<String>, initial_context: Map<String, Value>) -> Self {
        let task_states = dag
            .topo_order()
            .iter()
            .map(|id| (id.clone(), TaskState::default()))
            .collect();

        Self {
            instance_id: Uuid::now_v7(),
            dag_id: dag.dag_id().to_string(),
            owner_user_id: owner_user_id.into(),
            tenant: None,
            status: InstanceStatus::Pending,
            context: Context::from_map(initial_context),
            task_states,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            parent_instance_id: None,
            triggering_event: None,
            hook_depth: 0,
        }
    }

    /// Borrow a task's state
    pub fn task_state(&self, task_id: &str) -> Option<&TaskState> {
        self.task_states.get(task_id)
    }

    /// Mutably borrow a task's state
    pub fn task_state_mut(&mut self, task_id: &str) -> Option<&mut TaskState> {
        self.task_states.get_mut(task_id)
    }

    /// Promote `Pending` tasks whose upstreams are satisfied
    ///
    /// A task whose upstreams are *all* `Skipped` is itself marked
    /// `Skipped` (skip cascades down pure-skip paths); a fan-in with at
    /// least one completed parent becomes `Ready` and sees the skipped
    /// branch as success with empty output. Runs to a fixpoint since each
    /// cascade step can unlock further tasks.
    pub fn refresh_ready(&mut self, dag: &Dag) {
        loop {
            let mut changed = false;
            for task_id in dag.topo_order() {
                let Some(state) = self.task_states.get(task_id) else {
                    continue;
                };
                if state.status != TaskStatus::Pending {
                    continue;
                }

                let upstreams = dag.upstream_of(task_id);
                let satisfied = upstreams
                    .iter()
                    .all(|up| self.task_status(up).is_some_and(TaskStatus::satisfies_downstream));
                if !satisfied {
                    continue;
                }

                let all_skipped = !upstreams.is_empty()
                    && upstreams
                        .iter()
                        .all(|up| self.task_status(up) == Some(TaskStatus::Skipped));

                let state = self.task_states.get_mut(task_id).expect("checked above");
                if all_skipped {
                    state.status = TaskStatus::Skipped;
                    state.completed_at = Some(Utc::now());
                } else {
                    state.status = TaskStatus::Ready;
                }
                changed = true;
            }
            if !changed {
                break;
            }
        }
    }

    /// Task ids currently `Ready`, in topological order
    pub fn ready_tasks(&self, dag: &Dag) -> Vec<String> {
        dag.topo_order()
            .iter()
            .filter(|id| self.task_status(id) == Some(TaskStatus::Ready))
            .cloned()
            .collect()
    }

    /// Tasks currently `Waiting`, with what they wait for and any timed wake
    pub fn waiting_tasks(&self) -> Vec<(&str, Option<&str>, Option<DateTime<Utc>>)> {
        self.task_states
            .iter()
            .filter(|(_, s)| s.status == TaskStatus::Waiting)
            .map(|(id, s)| (id.as_str(), s.waiting_for.as_deref(), s.next_eligible_at))
            .collect()
    }

    fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.task_states.get(task_id).map(|s| s.status)
    }

    // ========================================================================
    // Transitions (applied by the executor from TaskResult values)
    // ========================================================================

    /// `Ready` → `Executing`; bumps the attempt counter
    pub fn begin_task(&mut self, task_id: &str) {
        if let Some(state) = self.task_states.get_mut(task_id) {
            if matches!(state.status, TaskStatus::Ready) {
                state.status = TaskStatus::Executing;
                state.attempt_count += 1;
                state.started_at.get_or_insert_with(Utc::now);
            }
        }
    }

    /// `Executing` → `Completed`; writes the output (once) and merges it
    /// into the context
    pub fn complete_task(&mut self, task_id: &str, data: Map<String, Value>) {
        let Some(state) = self.task_states.get_mut(task_id) else {
            return;
        };
        if state.status != TaskStatus::Executing {
            return;
        }
        state.status = TaskStatus::Completed;
        state.completed_at = Some(Utc::now());
        state.waiting_for = None;
        state.next_eligible_at = None;
        state.error_message = None;
        if state.output.is_none() {
            state.output = Some(data.clone());
            self.context.merge(data);
        }
    }

    /// `Executing` → `Waiting`; merges the pre-suspension data into the
    /// context so the next attempt observes it
    pub fn park_task(
        &mut self,
        task_id: &str,
        data: Map<String, Value>,
        waiting_for: impl Into<String>,
        next_eligible_at: Option<DateTime<Utc>>,
    ) {
        let Some(state) = self.task_states.get_mut(task_id) else {
            return;
        };
        if state.status != TaskStatus::Executing {
            return;
        }
        state.status = TaskStatus::Waiting;
        state.waiting_for = Some(waiting_for.into());
        state.next_eligible_at = next_eligible_at;
        state.first_waiting_at.get_or_insert_with(Utc::now);
        self.context.merge(data);
    }

    /// `Executing` → `Retry` with the transient error recorded
    pub fn retry_task(
        &mut self,
        task_id: &str,
        error: impl Into<String>,
        next_eligible_at: Option<DateTime<Utc>>,
    ) {
        if let Some(state) = self.task_states.get_mut(task_id) {
            if state.status == TaskStatus::Executing {
                state.status = TaskStatus::Retry;
                state.error_message = Some(error.into());
                state.next_eligible_at = next_eligible_at;
            }
        }
    }

    /// `Waiting`/`Retry` → `Ready` (input arrived or the timed wake fired)
    pub fn wake_task(&mut self, task_id: &str) {
        if let Some(state) = self.task_states.get_mut(task_id) {
            if matches!(state.status, TaskStatus::Waiting | TaskStatus::Retry) {
                state.status = TaskStatus::Ready;
                state.next_eligible_at = None;
            }
        }
    }

    /// `Executing` → `Skipped`
    pub fn skip_task(&mut self, task_id: &str, reason: impl Into<String>) {
        if let Some(state) = self.task_states.get_mut(task_id) {
            if state.status == TaskStatus::Executing {
                state.status = TaskStatus::Skipped;
                state.completed_at = Some(Utc::now());
                state
                    .metadata
                    .insert("skip_reason".to_string(), Value::String(reason.into()));
            }
        }
    }

    /// Any non-terminal → `Failed` with the terminal error recorded
    pub fn fail_task(&mut self, task_id: &str, error: impl Into<String>) {
        if let Some(state) = self.task_states.get_mut(task_id) {
            if !state.status.is_terminal() {
                state.status = TaskStatus::Failed;
                state.error_message = Some(error.into());
                state.completed_at = Some(Utc::now());
            }
        }
    }

    /// Mark every non-terminal task `Cancelled`
    pub fn cancel_remaining(&mut self) {
        let now = Utc::now();
        for state in self.task_states.values_mut() {
            if !state.status.is_terminal() {
                state.status = TaskStatus::Cancelled;
                state.completed_at = Some(now);
                state.waiting_for = None;
                state.next_eligible_at = None;
            }
        }
    }

    /// Re-derive the instance status from the task table and update
    /// lifecycle timestamps. Returns the new status.
    pub fn refresh_status(&mut self) -> InstanceStatus {
        let status = derive_status(&self.task_states);
        if status == InstanceStatus::Running {
            self.started_at.get_or_insert_with(Utc::now);
        }
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        self.status = status;
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::test_support::MarkerOperator;
    use crate::dag::DagBuilder;
    use serde_json::json;

    fn linear_dag() -> Dag {
        DagBuilder::new("linear")
            .task(MarkerOperator::new("a"))
            .task(MarkerOperator::new("b"))
            .task(MarkerOperator::new("c"))
            .chain(["a", "b", "c"])
            .build()
            .unwrap()
    }

    fn output(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_new_instance_is_pending() {
        let dag = linear_dag();
        let instance = Instance::new(&dag, "citizen-1", Map::new());

        assert_eq!(instance.status, InstanceStatus::Pending);
        assert_eq!(instance.task_states.len(), 3);
        assert!(instance
            .task_states
            .values()
            .all(|s| s.status == TaskStatus::Pending));
    }

    #[test]
    fn test_ready_promotion_follows_edges() {
        let dag = linear_dag();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());

        instance.refresh_ready(&dag);
        assert_eq!(instance.ready_tasks(&dag), ["a"]);

        instance.begin_task("a");
        instance.complete_task("a", output(json!({"a_done": true})));
        instance.refresh_ready(&dag);
        assert_eq!(instance.ready_tasks(&dag), ["b"]);
    }

    #[test]
    fn test_output_written_once_and_merged() {
        let dag = linear_dag();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());
        instance.refresh_ready(&dag);
        instance.begin_task("a");
        instance.complete_task("a", output(json!({"a_value": 1})));

        let state = instance.task_state("a").unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.output.as_ref().unwrap().get("a_value"), Some(&json!(1)));
        assert_eq!(instance.context.get("a_value"), Some(&json!(1)));

        // A second completion attempt must not rewrite the output
        instance.complete_task("a", output(json!({"a_value": 2})));
        assert_eq!(
            instance.task_state("a").unwrap().output.as_ref().unwrap().get("a_value"),
            Some(&json!(1))
        );
        assert_eq!(instance.context.get("a_value"), Some(&json!(1)));
    }

    #[test]
    fn test_status_derivation_table() {
        let dag = linear_dag();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());
        assert_eq!(derive_status(&instance.task_states), InstanceStatus::Pending);

        instance.refresh_ready(&dag);
        assert_eq!(derive_status(&instance.task_states), InstanceStatus::Running);

        instance.begin_task("a");
        instance.park_task("a", Map::new(), "user_input", None);
        assert_eq!(derive_status(&instance.task_states), InstanceStatus::Paused);

        instance.wake_task("a");
        instance.begin_task("a");
        instance.complete_task("a", Map::new());
        instance.refresh_ready(&dag);
        instance.begin_task("b");
        instance.fail_task("b", "boom");
        assert_eq!(derive_status(&instance.task_states), InstanceStatus::Failed);
    }

    #[test]
    fn test_all_completed_is_completed() {
        let dag = linear_dag();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());

        for id in ["a", "b", "c"] {
            instance.refresh_ready(&dag);
            instance.begin_task(id);
            instance.complete_task(id, Map::new());
        }

        assert_eq!(instance.refresh_status(), InstanceStatus::Completed);
        assert!(instance.completed_at.is_some());
    }

    #[test]
    fn test_status_always_matches_derivation() {
        let dag = linear_dag();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());

        instance.refresh_ready(&dag);
        instance.refresh_status();
        assert_eq!(instance.status, derive_status(&instance.task_states));

        instance.begin_task("a");
        instance.refresh_status();
        assert_eq!(instance.status, derive_status(&instance.task_states));

        instance.park_task("a", Map::new(), "user_input", None);
        instance.refresh_status();
        assert_eq!(instance.status, derive_status(&instance.task_states));
    }

    #[test]
    fn test_waiting_preserves_pre_suspension_data() {
        let dag = linear_dag();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());
        instance.refresh_ready(&dag);
        instance.begin_task("a");
        instance.park_task(
            "a",
            output(json!({"a_state": {"run_id": "r-9"}})),
            "external_poll:remote_dag",
            None,
        );

        assert_eq!(
            instance.context.get_path("a_state.run_id"),
            Some(&json!("r-9"))
        );
        let state = instance.task_state("a").unwrap();
        assert!(state.first_waiting_at.is_some());
    }

    #[test]
    fn test_first_waiting_at_not_reset() {
        let dag = linear_dag();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());
        instance.refresh_ready(&dag);
        instance.begin_task("a");
        instance.park_task("a", Map::new(), "user_input", None);
        let first = instance.task_state("a").unwrap().first_waiting_at;

        instance.wake_task("a");
        instance.begin_task("a");
        instance.park_task("a", Map::new(), "user_input", None);
        assert_eq!(instance.task_state("a").unwrap().first_waiting_at, first);
    }

    #[test]
    fn test_skip_cascades_down_pure_skip_paths() {
        let dag = linear_dag();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());
        instance.refresh_ready(&dag);
        instance.begin_task("a");
        instance.skip_task("a", "nothing to do");
        instance.refresh_ready(&dag);

        assert_eq!(instance.task_status("b"), Some(TaskStatus::Skipped));
        assert_eq!(instance.task_status("c"), Some(TaskStatus::Skipped));
        assert_eq!(instance.refresh_status(), InstanceStatus::Completed);
    }

    #[test]
    fn test_join_with_completed_parent_survives_sibling_skip() {
        let dag = DagBuilder::new("join")
            .task(MarkerOperator::new("a"))
            .task(MarkerOperator::new("b"))
            .task(MarkerOperator::new("c"))
            .task(MarkerOperator::new("join"))
            .fan_out("a", ["b", "c"])
            .fan_in(["b", "c"], "join")
            .build()
            .unwrap();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());

        instance.refresh_ready(&dag);
        instance.begin_task("a");
        instance.complete_task("a", Map::new());
        instance.refresh_ready(&dag);
        instance.begin_task("b");
        instance.complete_task("b", Map::new());
        instance.begin_task("c");
        instance.skip_task("c", "branch not applicable");
        instance.refresh_ready(&dag);

        assert_eq!(instance.task_status("join"), Some(TaskStatus::Ready));
    }

    #[test]
    fn test_cancel_remaining() {
        let dag = linear_dag();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());
        instance.refresh_ready(&dag);
        instance.begin_task("a");
        instance.complete_task("a", Map::new());
        instance.refresh_ready(&dag);
        instance.begin_task("b");
        instance.park_task("b", Map::new(), "approval", None);

        instance.cancel_remaining();

        assert_eq!(instance.task_status("a"), Some(TaskStatus::Completed));
        assert_eq!(instance.task_status("b"), Some(TaskStatus::Cancelled));
        assert_eq!(instance.task_status("c"), Some(TaskStatus::Cancelled));
        assert_eq!(instance.refresh_status(), InstanceStatus::Cancelled);
    }

    #[test]
    fn test_retry_counts_as_running() {
        let dag = linear_dag();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());
        instance.refresh_ready(&dag);
        instance.begin_task("a");
        instance.retry_task("a", "transient", None);

        assert_eq!(derive_status(&instance.task_states), InstanceStatus::Running);
        assert_eq!(instance.task_state("a").unwrap().attempt_count, 1);
    }

    #[test]
    fn test_persisted_shape_round_trips() {
        let dag = linear_dag();
        let mut instance = Instance::new(&dag, "citizen-1", Map::new());
        instance.refresh_ready(&dag);
        instance.begin_task("a");
        instance.park_task("a", output(json!({"a_state": 1})), "user_input", None);
        instance.refresh_status();

        let encoded = serde_json::to_string(&instance).unwrap();
        let decoded: Instance = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.instance_id, instance.instance_id);
        assert_eq!(decoded.status, InstanceStatus::Paused);
        assert_eq!(decoded.context, instance.context);
        assert_eq!(
            decoded.task_state("a").unwrap().status,
            TaskStatus::Waiting
        );
    }
}
