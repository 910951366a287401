//! Workflow engine
//!
//! The `Engine` drives many workflow instances concurrently:
//!
//! - A scheduler loop feeds a bounded pool of workers from the ready queue.
//! - Each worker advances one instance at a time; tasks of the same
//!   instance never execute concurrently (a per-instance lock serializes
//!   advancement against intake and cancellation).
//! - Instances whose tasks return `Waiting` are parked in a wait table
//!   until input arrives through the intake surface or a timed wake fires.
//! - Every transition funnels through the store before its effects (event
//!   dispatch, listener creation) become visible.

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use civiflow_core::context::input_key;
use civiflow_core::dag::{Dag, DagBag};
use civiflow_core::event::{self, Event, EventBuffer};
use civiflow_core::hook::Hook;
use civiflow_core::instance::{Instance, InstanceStatus, TaskStatus};
use civiflow_core::operator::{TaskContext, TaskResult};

use crate::config::EngineConfig;
use crate::error::{EngineError, IntakeError};
use crate::hooks::HookRegistry;
use crate::persistence::{
    DagRegistration, InstanceFilter, InstanceStore, Pagination, StoreError,
};

/// Decision delivered to a waiting approval task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPayload {
    /// `"approved"` or `"rejected"`
    pub decision: String,

    /// User who made the decision
    pub decided_by: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl DecisionPayload {
    /// An approval decision
    pub fn approved(decided_by: impl Into<String>) -> Self {
        Self {
            decision: "approved".to_string(),
            decided_by: decided_by.into(),
            comments: None,
            rejection_reason: None,
        }
    }

    /// A rejection with a reason
    pub fn rejected(decided_by: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            decision: "rejected".to_string(),
            decided_by: decided_by.into(),
            comments: None,
            rejection_reason: Some(reason.into()),
        }
    }

    /// Attach reviewer comments
    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }
}

/// Point-in-time engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub queued: usize,
    pub parked: usize,
    pub active_workers: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
}

/// Entry in the wait table for one suspended task
#[derive(Debug, Clone)]
struct WaitEntry {
    #[allow(dead_code)] // Surfaced through instance snapshots; kept for debugging
    task_id: String,
    next_eligible_at: Option<DateTime<Utc>>,
    timeout_at: Option<DateTime<Utc>>,
}

/// Ready queue with de-duplicated membership
#[derive(Default)]
struct ReadyQueue {
    queue: VecDeque<Uuid>,
    members: HashSet<Uuid>,
}

impl ReadyQueue {
    fn push(&mut self, id: Uuid) -> bool {
        if self.members.insert(id) {
            self.queue.push_back(id);
            true
        } else {
            false
        }
    }

    fn pop(&mut self) -> Option<Uuid> {
        let id = self.queue.pop_front()?;
        self.members.remove(&id);
        Some(id)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// The workflow engine
///
/// Cheap to clone; all clones share the same scheduler state.
///
/// # Example
///
/// ```ignore
/// use civiflow_engine::prelude::*;
///
/// let store = Arc::new(InMemoryInstanceStore::new());
/// let engine = Engine::new(store);
/// engine.register_dag(build_registration_dag()?).await?;
/// engine.start()?;
///
/// let instance_id = engine
///     .create_instance("property_registration", "citizen-1", None)
///     .await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    dag_bag: DagBag,
    hooks: HookRegistry,
    store: Arc<dyn InstanceStore>,
    ready: parking_lot::Mutex<ReadyQueue>,
    work_available: Notify,
    permits: Arc<Semaphore>,
    instance_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    wait_table: DashMap<Uuid, Vec<WaitEntry>>,
    cancel_requested: DashMap<Uuid, ()>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
    total_cancelled: AtomicU64,
}

impl Engine {
    /// Create an engine over the given store with default configuration
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    /// Create an engine with custom configuration
    pub fn with_config(store: Arc<dyn InstanceStore>, config: EngineConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_instances));

        Self {
            inner: Arc::new(EngineInner {
                config,
                dag_bag: DagBag::new(),
                hooks: HookRegistry::new(),
                store,
                ready: parking_lot::Mutex::new(ReadyQueue::default()),
                work_available: Notify::new(),
                permits,
                instance_locks: DashMap::new(),
                wait_table: DashMap::new(),
                cancel_requested: DashMap::new(),
                started: AtomicBool::new(false),
                shutdown_tx,
                handles: parking_lot::Mutex::new(vec![]),
                total_completed: AtomicU64::new(0),
                total_failed: AtomicU64::new(0),
                total_cancelled: AtomicU64::new(0),
            }),
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a DAG in the bag and record the registration in the store
    pub async fn register_dag(&self, dag: Dag) -> Result<(), EngineError> {
        let registration = DagRegistration {
            dag_id: dag.dag_id().to_string(),
            description: dag.description().to_string(),
            workflow_type: dag.workflow_type().to_string(),
            task_count: dag.len() as u32,
            registered_at: Utc::now(),
        };

        self.inner.dag_bag.register(dag)?;
        self.inner.store.save_dag_registration(&registration).await?;
        info!(dag_id = %registration.dag_id, tasks = registration.task_count, "registered dag");
        Ok(())
    }

    /// Register a hook rule
    pub fn register_hook(&self, hook: Hook) {
        self.inner.hooks.register(hook);
    }

    /// Ids of all registered DAGs
    pub fn dag_ids(&self) -> Vec<String> {
        self.inner.dag_bag.dag_ids()
    }

    /// Informational listing of recorded DAG registrations
    pub async fn list_dags(&self) -> Result<Vec<DagRegistration>, EngineError> {
        Ok(self.inner.store.list_dag_registrations().await?)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the scheduler and sweeper loops
    pub fn start(&self) -> Result<(), EngineError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        let scheduler = {
            let inner = self.inner.clone();
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            tokio::spawn(async move { inner.scheduler_loop(shutdown_rx).await })
        };
        let sweeper = {
            let inner = self.inner.clone();
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            tokio::spawn(async move { inner.sweeper_loop(shutdown_rx).await })
        };

        let mut handles = self.inner.handles.lock();
        handles.push(scheduler);
        handles.push(sweeper);

        info!(
            max_concurrent = self.inner.config.max_concurrent_instances,
            "engine started"
        );
        Ok(())
    }

    /// Stop the scheduler, then wait for in-flight workers to finish
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.work_available.notify_waiters();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }

        // Workers hold permits while driving; reacquiring them all means
        // every in-flight instance has been released.
        let all = self.inner.config.max_concurrent_instances as u32;
        let drained = tokio::time::timeout(
            self.inner.config.shutdown_timeout,
            self.inner.permits.acquire_many(all),
        )
        .await;
        match drained {
            Ok(Ok(permit)) => drop(permit),
            _ => warn!("graceful shutdown timed out with workers still active"),
        }

        self.inner.started.store(false, Ordering::SeqCst);
        info!("engine stopped");
    }

    // ========================================================================
    // Instance API
    // ========================================================================

    /// Create an instance of a registered DAG and queue it for execution
    #[instrument(skip(self, initial_context))]
    pub async fn create_instance(
        &self,
        dag_id: &str,
        owner_user_id: &str,
        initial_context: Option<Map<String, Value>>,
    ) -> Result<Uuid, EngineError> {
        let dag = self
            .inner
            .dag_bag
            .get(dag_id)
            .ok_or_else(|| EngineError::DagNotFound(dag_id.to_string()))?;
        self.inner.check_capacity()?;

        let instance = Instance::new(&dag, owner_user_id, initial_context.unwrap_or_default());
        let instance_id = instance.instance_id;

        self.inner.store.save_instance(&instance).await?;
        self.inner.enqueue(instance_id);

        info!(%instance_id, dag_id, "created instance");
        Ok(instance_id)
    }

    /// Deliver external input to a waiting task
    ///
    /// The payload lands at the task's reserved `"{task_id}_input"` key
    /// and the instance is re-queued. Rejected unless the task is
    /// currently `Waiting`; calling again after the task moved on is
    /// therefore rejected rather than double-applied.
    #[instrument(skip(self, payload))]
    pub async fn deliver_input(
        &self,
        instance_id: Uuid,
        task_id: &str,
        payload: Value,
    ) -> Result<(), IntakeError> {
        self.inner.deliver(instance_id, task_id, payload).await
    }

    /// Deliver an approval decision to a waiting task
    ///
    /// Same mechanism as [`Engine::deliver_input`]; the decision fields
    /// arrive as the task's input object.
    #[instrument(skip(self, decision))]
    pub async fn deliver_decision(
        &self,
        instance_id: Uuid,
        task_id: &str,
        decision: DecisionPayload,
    ) -> Result<(), IntakeError> {
        let payload = serde_json::to_value(&decision)
            .map_err(|e| IntakeError::Store(StoreError::Serialization(e.to_string())))?;
        self.inner.deliver(instance_id, task_id, payload).await
    }

    /// Request cancellation of an instance
    ///
    /// The flag is observed at the next dispatch: non-terminal tasks are
    /// marked `Cancelled` and the instance becomes `Cancelled`. In-flight
    /// operator work runs to its natural result, which is then discarded.
    #[instrument(skip(self))]
    pub async fn cancel_instance(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let instance = self.inner.load(instance_id).await?;
        if instance.status.is_terminal() {
            debug!(%instance_id, status = %instance.status, "cancel ignored for terminal instance");
            return Ok(());
        }

        self.inner.cancel_requested.insert(instance_id, ());
        self.inner.wait_table.remove(&instance_id);
        self.inner.enqueue(instance_id);
        info!(%instance_id, "cancellation requested");
        Ok(())
    }

    /// Snapshot of an instance
    pub async fn get_instance(&self, instance_id: Uuid) -> Result<Instance, EngineError> {
        self.inner.load(instance_id).await
    }

    /// List instances matching a filter
    pub async fn list_instances(
        &self,
        filter: InstanceFilter,
        page: Pagination,
    ) -> Result<Vec<Instance>, EngineError> {
        Ok(self.inner.store.list_instances(filter, page).await?)
    }

    /// Inject an event from outside the operator layer
    ///
    /// Returns the number of listener instances created.
    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn emit_event(&self, event: Event) -> Result<usize, EngineError> {
        Ok(self.inner.dispatch_event(event, 0).await)
    }

    /// Current scheduler statistics
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            queued: self.inner.ready.lock().len(),
            parked: self.inner.wait_table.len(),
            active_workers: self.inner.config.max_concurrent_instances
                - self.inner.permits.available_permits(),
            total_completed: self.inner.total_completed.load(Ordering::Relaxed),
            total_failed: self.inner.total_failed.load(Ordering::Relaxed),
            total_cancelled: self.inner.total_cancelled.load(Ordering::Relaxed),
        }
    }
}

impl EngineInner {
    // ========================================================================
    // Queue plumbing
    // ========================================================================

    fn enqueue(&self, instance_id: Uuid) {
        if self.ready.lock().push(instance_id) {
            self.work_available.notify_one();
        }
    }

    fn pop_ready(&self) -> Option<Uuid> {
        self.ready.lock().pop()
    }

    fn check_capacity(&self) -> Result<(), EngineError> {
        let queued = self.ready.lock().len();
        if queued >= self.config.ready_queue_soft_cap {
            return Err(EngineError::Busy { queued });
        }
        Ok(())
    }

    fn lock_for(&self, instance_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.instance_locks
            .entry(instance_id)
            .or_default()
            .clone()
    }

    async fn load(&self, instance_id: Uuid) -> Result<Instance, EngineError> {
        self.store.load_instance(instance_id).await.map_err(|e| match e {
            StoreError::InstanceNotFound(id) => EngineError::InstanceNotFound(id),
            other => EngineError::Store(other),
        })
    }

    // ========================================================================
    // Scheduler and sweeper loops
    // ========================================================================

    async fn scheduler_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        debug!("scheduler loop started");
        loop {
            let permit = tokio::select! {
                _ = shutdown_rx.changed() => break,
                permit = self.permits.clone().acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
            };

            let Some(instance_id) = self.pop_ready() else {
                drop(permit);
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = self.work_available.notified() => {}
                }
                continue;
            };

            let worker = self.clone();
            tokio::spawn(async move {
                worker.drive(instance_id).await;
                drop(permit);
            });
        }
        debug!("scheduler loop stopped");
    }

    async fn sweeper_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }

            let now = Utc::now();
            let due: Vec<Uuid> = self
                .wait_table
                .iter()
                .filter(|entry| {
                    entry.value().iter().any(|w| {
                        w.next_eligible_at.is_some_and(|t| t <= now)
                            || w.timeout_at.is_some_and(|t| t <= now)
                    })
                })
                .map(|entry| *entry.key())
                .collect();

            for instance_id in due {
                self.wait_table.remove(&instance_id);
                debug!(%instance_id, "timed wake");
                self.enqueue(instance_id);
            }
        }
    }

    // ========================================================================
    // Instance advancement
    // ========================================================================

    /// Advance one instance as far as it can go in this dispatch
    #[instrument(skip(self))]
    async fn drive(&self, instance_id: Uuid) {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = match self.store.load_instance(instance_id).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!(%instance_id, error = %e, "cannot load instance for dispatch");
                return;
            }
        };
        if instance.status.is_terminal() {
            return;
        }
        let Some(dag) = self.dag_bag.get(&instance.dag_id) else {
            error!(%instance_id, dag_id = %instance.dag_id, "instance references unregistered dag");
            return;
        };

        if self.cancel_requested.remove(&instance_id).is_some() {
            self.apply_cancel(&mut instance).await;
            return;
        }

        self.expire_timed_out_tasks(&dag, &mut instance);
        wake_eligible_tasks(&mut instance);

        'advance: loop {
            instance.refresh_ready(&dag);
            let ready = instance.ready_tasks(&dag);
            if ready.is_empty() {
                break;
            }

            // Tasks of one instance execute serially, in topological order.
            for task_id in ready {
                if self.cancel_requested.remove(&instance_id).is_some() {
                    self.apply_cancel(&mut instance).await;
                    return;
                }

                let events = match self.execute_task(&dag, &mut instance, &task_id).await {
                    Ok(events) => events,
                    Err(e) => {
                        // Leave the instance at its last persisted state;
                        // no silent status advancement on engine errors.
                        error!(%instance_id, %task_id, error = %e, "persistence failure during dispatch");
                        return;
                    }
                };
                for event in events {
                    self.dispatch_event(event, instance.hook_depth).await;
                }

                if instance.task_state(&task_id).map(|s| s.status) == Some(TaskStatus::Failed) {
                    break 'advance;
                }
            }
        }

        let status = instance.refresh_status();
        if let Err(e) = self.store.save_instance(&instance).await {
            error!(%instance_id, error = %e, "failed to persist instance after dispatch");
            return;
        }

        match status {
            InstanceStatus::Completed => {
                self.wait_table.remove(&instance_id);
                self.instance_locks.remove(&instance_id);
                self.total_completed.fetch_add(1, Ordering::Relaxed);
                info!(%instance_id, "instance completed");
                let payload = terminal_payload(&instance, None);
                let event = Event::new(
                    event::WORKFLOW_COMPLETED,
                    &instance.dag_id,
                    instance.instance_id,
                    payload,
                );
                self.dispatch_event(event, instance.hook_depth).await;
            }
            InstanceStatus::Failed => {
                self.wait_table.remove(&instance_id);
                self.instance_locks.remove(&instance_id);
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                let failed_task = first_failed_task(&instance);
                error!(
                    %instance_id,
                    failed_task = failed_task.as_deref().unwrap_or("unknown"),
                    "instance failed"
                );
                let payload = terminal_payload(&instance, failed_task.as_deref());
                let event = Event::new(
                    event::WORKFLOW_FAILED,
                    &instance.dag_id,
                    instance.instance_id,
                    payload,
                );
                self.dispatch_event(event, instance.hook_depth).await;
            }
            InstanceStatus::Cancelled => {
                self.wait_table.remove(&instance_id);
                self.instance_locks.remove(&instance_id);
                self.total_cancelled.fetch_add(1, Ordering::Relaxed);
            }
            InstanceStatus::Paused | InstanceStatus::Running => {
                // Waiting for input, a timed wake, or a retry slot.
                self.park(&dag, &instance);
                debug!(%instance_id, %status, "instance parked");
            }
            InstanceStatus::Pending => {
                warn!(%instance_id, "instance has no executable tasks");
            }
        }
    }

    /// Execute one ready task and persist the resulting transition.
    ///
    /// Returns the events the operator emitted, stamped with their source,
    /// for dispatch after the save.
    async fn execute_task(
        &self,
        dag: &Dag,
        instance: &mut Instance,
        task_id: &str,
    ) -> Result<Vec<Event>, StoreError> {
        let operator = dag
            .task(task_id)
            .expect("ready task ids come from the dag")
            .clone();

        instance.begin_task(task_id);
        let attempt = instance
            .task_state(task_id)
            .map(|s| s.attempt_count)
            .unwrap_or(1);

        debug!(
            instance_id = %instance.instance_id,
            task_id,
            attempt,
            operator_type = operator.operator_type(),
            "executing task"
        );

        let mut buffer = EventBuffer::new();
        let (result, assigned_to) = {
            let mut task_ctx = TaskContext::new(task_id, attempt, &instance.context, &mut buffer);
            let result = match AssertUnwindSafe(operator.execute(&mut task_ctx))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(task_id, %message, "operator panicked; converting to task failure");
                    TaskResult::failed(format!("operator panicked: {message}"))
                }
            };
            let assigned_to = task_ctx.assigned_to().map(str::to_string);
            (result, assigned_to)
        };

        if let Some(assignee) = assigned_to {
            if let Some(state) = instance.task_state_mut(task_id) {
                state.assigned_to = Some(assignee);
            }
        }

        let now = Utc::now();
        match result {
            TaskResult::Continue { data } => {
                instance.complete_task(task_id, data);
            }
            TaskResult::Waiting {
                data,
                waiting_for,
                retry_delay,
            } => {
                let next_eligible = retry_delay
                    .and_then(|d| TimeDelta::from_std(d).ok())
                    .and_then(|d| now.checked_add_signed(d));
                instance.park_task(task_id, data, waiting_for, next_eligible);
            }
            TaskResult::Retry { error, delay } => {
                if attempt > operator.max_attempts() {
                    instance.fail_task(
                        task_id,
                        format!(
                            "{error} (max_attempts exceeded: attempt {attempt} of {})",
                            operator.max_attempts()
                        ),
                    );
                } else {
                    let delay = delay
                        .unwrap_or_else(|| self.config.retry_policy.delay_for_attempt(attempt + 1));
                    let next_eligible = TimeDelta::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d));
                    warn!(task_id, attempt, %error, ?delay, "task retry scheduled");
                    instance.retry_task(task_id, error, next_eligible);
                }
            }
            TaskResult::Skip { reason } => {
                debug!(task_id, %reason, "task skipped");
                instance.skip_task(task_id, reason);
            }
            TaskResult::Failed { error } => {
                instance.fail_task(task_id, error);
            }
        }

        instance.refresh_status();
        self.store.save_instance(instance).await?;

        // Stamp operator events only after the transition is durable.
        Ok(buffer
            .drain()
            .into_iter()
            .map(|pending| {
                Event::new(
                    pending.event_type,
                    &instance.dag_id,
                    instance.instance_id,
                    pending.payload,
                )
            })
            .collect())
    }

    /// Fail waiting tasks whose operator-declared timeout has expired.
    /// The clock starts at the first `Waiting` transition and is never
    /// reset by re-waiting.
    fn expire_timed_out_tasks(&self, dag: &Dag, instance: &mut Instance) {
        let now = Utc::now();
        let mut expired: Vec<(String, String)> = vec![];

        for task_id in dag.topo_order() {
            let Some(state) = instance.task_state(task_id) else {
                continue;
            };
            if state.status != TaskStatus::Waiting {
                continue;
            }
            let Some(timeout) = dag.task(task_id).and_then(|op| op.timeout()) else {
                continue;
            };
            let Some(first_waiting) = state.first_waiting_at else {
                continue;
            };
            let Ok(limit) = TimeDelta::from_std(timeout) else {
                continue;
            };
            if now - first_waiting >= limit {
                let waiting_for = state.waiting_for.clone().unwrap_or_default();
                expired.push((task_id.clone(), waiting_for));
            }
        }

        for (task_id, waiting_for) in expired {
            warn!(
                instance_id = %instance.instance_id,
                %task_id,
                %waiting_for,
                "task timed out"
            );
            instance.fail_task(&task_id, format!("timeout waiting for {waiting_for}"));
        }
    }

    async fn apply_cancel(&self, instance: &mut Instance) {
        let instance_id = instance.instance_id;
        instance.cancel_remaining();
        instance.refresh_status();
        if let Err(e) = self.store.save_instance(instance).await {
            error!(%instance_id, error = %e, "failed to persist cancellation");
            return;
        }
        self.wait_table.remove(&instance_id);
        self.instance_locks.remove(&instance_id);
        self.total_cancelled.fetch_add(1, Ordering::Relaxed);
        info!(%instance_id, "instance cancelled");
    }

    /// Record a suspended instance in the wait table so the sweeper can
    /// wake it for timed re-polls, retry slots, and timeout checks.
    fn park(&self, dag: &Dag, instance: &Instance) {
        let mut entries = vec![];
        for (task_id, state) in &instance.task_states {
            match state.status {
                TaskStatus::Waiting => {
                    let timeout_at = dag
                        .task(task_id)
                        .and_then(|op| op.timeout())
                        .and_then(|t| TimeDelta::from_std(t).ok())
                        .and_then(|t| state.first_waiting_at?.checked_add_signed(t));
                    entries.push(WaitEntry {
                        task_id: task_id.clone(),
                        next_eligible_at: state.next_eligible_at,
                        timeout_at,
                    });
                }
                TaskStatus::Retry => {
                    entries.push(WaitEntry {
                        task_id: task_id.clone(),
                        next_eligible_at: state.next_eligible_at,
                        timeout_at: None,
                    });
                }
                _ => {}
            }
        }

        if entries.is_empty() {
            self.wait_table.remove(&instance.instance_id);
        } else {
            self.wait_table.insert(instance.instance_id, entries);
        }
    }

    // ========================================================================
    // Intake
    // ========================================================================

    async fn deliver(
        &self,
        instance_id: Uuid,
        task_id: &str,
        payload: Value,
    ) -> Result<(), IntakeError> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.store.load_instance(instance_id).await.map_err(|e| match e {
            StoreError::InstanceNotFound(id) => IntakeError::InstanceNotFound(id),
            other => IntakeError::Store(other),
        })?;

        let Some(state) = instance.task_state(task_id) else {
            return Err(IntakeError::UnknownTask {
                instance_id,
                task_id: task_id.to_string(),
            });
        };
        if state.status != TaskStatus::Waiting {
            return Err(IntakeError::TaskNotWaiting {
                task_id: task_id.to_string(),
                status: state.status,
            });
        }

        instance.context.insert(input_key(task_id), payload.clone());
        instance.wake_task(task_id);
        if let Some(state) = instance.task_state_mut(task_id) {
            state.input_snapshot = Some(payload);
        }
        instance.refresh_status();

        // Durable before the intake call returns.
        self.store.save_instance(&instance).await?;

        self.wait_table.remove(&instance_id);
        self.enqueue(instance_id);
        info!(%instance_id, task_id, "input delivered");
        Ok(())
    }

    // ========================================================================
    // Hook dispatch
    // ========================================================================

    /// Match an event against the hook registry and create listener
    /// instances, bounded by the configured hook-chain depth.
    async fn dispatch_event(&self, event: Event, source_depth: u32) -> usize {
        let matched = self.hooks.matching(&event);
        if matched.is_empty() {
            return 0;
        }

        let child_depth = source_depth + 1;
        let mut created = 0;

        for hook in matched {
            if child_depth > self.config.hook_depth_limit {
                warn!(
                    hook_id = %hook.hook_id,
                    event_type = %event.event_type,
                    depth = child_depth,
                    limit = self.config.hook_depth_limit,
                    "hook depth limit exceeded; listener instance not created"
                );
                continue;
            }
            let Some(dag) = self.dag_bag.get(&hook.listener_workflow_id) else {
                warn!(
                    hook_id = %hook.hook_id,
                    listener = %hook.listener_workflow_id,
                    "hook listener dag not registered"
                );
                continue;
            };
            if let Err(e) = self.check_capacity() {
                warn!(hook_id = %hook.hook_id, error = %e, "listener instance rejected");
                continue;
            }

            let seed = hook.seed_context(&event);
            let owner = seed
                .get("owner_user_id")
                .and_then(Value::as_str)
                .unwrap_or("system")
                .to_string();

            let mut listener = Instance::new(&dag, owner, seed);
            listener.parent_instance_id = Some(event.source_instance_id);
            listener.triggering_event = Some(event.clone());
            listener.hook_depth = child_depth;
            let listener_id = listener.instance_id;

            match self.store.save_instance(&listener).await {
                Ok(()) => {
                    self.enqueue(listener_id);
                    created += 1;
                    info!(
                        hook_id = %hook.hook_id,
                        %listener_id,
                        listener_dag = %hook.listener_workflow_id,
                        event_type = %event.event_type,
                        "hook fired"
                    );
                }
                Err(e) => {
                    error!(hook_id = %hook.hook_id, error = %e, "failed to persist listener instance");
                }
            }
        }

        created
    }
}

/// Wake parked tasks whose timed-wake deadline has passed
fn wake_eligible_tasks(instance: &mut Instance) {
    let now = Utc::now();
    let due: Vec<String> = instance
        .task_states
        .iter()
        .filter(|(_, s)| {
            matches!(s.status, TaskStatus::Waiting | TaskStatus::Retry)
                && s.next_eligible_at.is_some_and(|t| t <= now)
        })
        .map(|(id, _)| id.clone())
        .collect();

    for task_id in due {
        instance.wake_task(&task_id);
    }
}

fn first_failed_task(instance: &Instance) -> Option<String> {
    instance
        .task_states
        .iter()
        .find(|(_, s)| s.status == TaskStatus::Failed)
        .map(|(id, _)| id.clone())
}

/// Payload for the engine's terminal events: the propagatable context plus
/// identifying fields (and the failing task's error, when failed)
fn terminal_payload(instance: &Instance, failed_task: Option<&str>) -> Map<String, Value> {
    let mut payload = instance.context.child_seed();
    payload.insert(
        "dag_id".to_string(),
        Value::String(instance.dag_id.clone()),
    );
    payload.insert(
        "instance_id".to_string(),
        Value::String(instance.instance_id.to_string()),
    );
    if let Some(task_id) = failed_task {
        payload.insert("failed_task".to_string(), Value::String(task_id.to_string()));
        if let Some(error) = instance
            .task_state(task_id)
            .and_then(|s| s.error_message.clone())
        {
            payload.insert("error".to_string(), Value::String(error));
        }
    }
    payload
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryInstanceStore;
    use async_trait::async_trait;
    use civiflow_core::dag::DagBuilder;
    use civiflow_core::operator::{waiting_for, Operator};
    use serde_json::json;
    use std::time::Duration;

    struct Immediate(String);

    #[async_trait]
    impl Operator for Immediate {
        fn task_id(&self) -> &str {
            &self.0
        }

        fn operator_type(&self) -> &'static str {
            "immediate"
        }

        async fn execute(&self, _ctx: &mut TaskContext<'_>) -> TaskResult {
            TaskResult::done_empty()
        }
    }

    struct WaitForInput(String);

    #[async_trait]
    impl Operator for WaitForInput {
        fn task_id(&self) -> &str {
            &self.0
        }

        fn operator_type(&self) -> &'static str {
            "wait_for_input"
        }

        async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
            match ctx.input() {
                Some(input) => {
                    let mut data = Map::new();
                    data.insert(format!("{}_received", self.0), input.clone());
                    TaskResult::done(data)
                }
                None => TaskResult::waiting(Map::new(), waiting_for::USER_INPUT),
            }
        }
    }

    struct Panics(String);

    #[async_trait]
    impl Operator for Panics {
        fn task_id(&self) -> &str {
            &self.0
        }

        fn operator_type(&self) -> &'static str {
            "panics"
        }

        async fn execute(&self, _ctx: &mut TaskContext<'_>) -> TaskResult {
            panic!("unexpected operator bug");
        }
    }

    fn test_engine() -> Engine {
        let store = Arc::new(InMemoryInstanceStore::new());
        Engine::with_config(
            store,
            EngineConfig::default().with_sweep_interval(Duration::from_millis(10)),
        )
    }

    async fn wait_for_status(engine: &Engine, id: Uuid, status: InstanceStatus) -> Instance {
        for _ in 0..200 {
            let instance = engine.get_instance(id).await.unwrap();
            if instance.status == status {
                return instance;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("instance {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_create_requires_registered_dag() {
        let engine = test_engine();
        let result = engine.create_instance("missing", "u-1", None).await;
        assert!(matches!(result, Err(EngineError::DagNotFound(_))));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let engine = test_engine();
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_linear_dag_runs_to_completion() {
        let engine = test_engine();
        engine
            .register_dag(
                DagBuilder::new("linear")
                    .task(Immediate("a".into()))
                    .task(Immediate("b".into()))
                    .chain(["a", "b"])
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        engine.start().unwrap();

        let id = engine.create_instance("linear", "u-1", None).await.unwrap();
        let instance = wait_for_status(&engine, id, InstanceStatus::Completed).await;

        assert!(instance.completed_at.is_some());
        assert_eq!(
            instance.task_state("a").unwrap().status,
            TaskStatus::Completed
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_deliver_to_non_waiting_task_rejected() {
        let engine = test_engine();
        engine
            .register_dag(
                DagBuilder::new("wf")
                    .task(WaitForInput("collect".into()))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        engine.start().unwrap();

        let id = engine.create_instance("wf", "u-1", None).await.unwrap();
        wait_for_status(&engine, id, InstanceStatus::Paused).await;

        // First delivery accepted, instance completes
        engine
            .deliver_input(id, "collect", json!({"name": "Ana"}))
            .await
            .unwrap();
        wait_for_status(&engine, id, InstanceStatus::Completed).await;

        // Second delivery rejected: the task is no longer waiting
        let result = engine.deliver_input(id, "collect", json!({"name": "Ana"})).await;
        assert!(matches!(result, Err(IntakeError::TaskNotWaiting { .. })));

        // Unknown task rejected
        let result = engine.deliver_input(id, "ghost", json!({})).await;
        assert!(matches!(result, Err(IntakeError::UnknownTask { .. })));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_operator_panic_becomes_task_failure() {
        let engine = test_engine();
        engine
            .register_dag(
                DagBuilder::new("wf")
                    .task(Panics("boom".into()))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        engine.start().unwrap();

        let id = engine.create_instance("wf", "u-1", None).await.unwrap();
        let instance = wait_for_status(&engine, id, InstanceStatus::Failed).await;

        let state = instance.task_state("boom").unwrap();
        assert_eq!(state.status, TaskStatus::Failed);
        assert!(state
            .error_message
            .as_ref()
            .unwrap()
            .contains("operator panicked"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_waiting_instance() {
        let engine = test_engine();
        engine
            .register_dag(
                DagBuilder::new("wf")
                    .task(WaitForInput("collect".into()))
                    .task(Immediate("finish".into()))
                    .chain(["collect", "finish"])
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        engine.start().unwrap();

        let id = engine.create_instance("wf", "u-1", None).await.unwrap();
        wait_for_status(&engine, id, InstanceStatus::Paused).await;

        engine.cancel_instance(id).await.unwrap();
        let instance = wait_for_status(&engine, id, InstanceStatus::Cancelled).await;

        assert_eq!(
            instance.task_state("collect").unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            instance.task_state("finish").unwrap().status,
            TaskStatus::Cancelled
        );

        // Input delivery after cancellation is rejected
        let result = engine.deliver_input(id, "collect", json!({})).await;
        assert!(matches!(result, Err(IntakeError::TaskNotWaiting { .. })));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_busy_rejection_at_soft_cap() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let engine = Engine::with_config(
            store,
            EngineConfig::default().with_ready_queue_soft_cap(1),
        );
        engine
            .register_dag(
                DagBuilder::new("wf")
                    .task(Immediate("only".into()))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        // Engine not started: the queue cannot drain.

        engine.create_instance("wf", "u-1", None).await.unwrap();
        let result = engine.create_instance("wf", "u-2", None).await;
        assert!(matches!(result, Err(EngineError::Busy { queued: 1 })));
    }

    #[tokio::test]
    async fn test_stats_reflect_terminal_counts() {
        let engine = test_engine();
        engine
            .register_dag(
                DagBuilder::new("wf")
                    .task(Immediate("only".into()))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        engine.start().unwrap();

        let id = engine.create_instance("wf", "u-1", None).await.unwrap();
        wait_for_status(&engine, id, InstanceStatus::Completed).await;

        let stats = engine.stats();
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.total_failed, 0);
        engine.shutdown().await;
    }
}
