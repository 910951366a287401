//! End-to-end scenarios driving the engine through full workflows:
//! human input, approval decisions, fan-out/fan-in, remote polling,
//! hook chains, retry caps, and timeouts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use civiflow_core::dag::{Dag, DagBuilder};
use civiflow_core::event;
use civiflow_core::instance::{derive_status, Instance, InstanceStatus, TaskStatus};
use civiflow_core::operator::{Operator, TaskContext, TaskResult};
use civiflow_core::Hook;
use civiflow_engine::prelude::*;
use civiflow_operators::prelude::*;
use civiflow_operators::remote_dag::RemoteRunState;

fn test_engine() -> Engine {
    let store = Arc::new(InMemoryInstanceStore::new());
    Engine::with_config(
        store,
        EngineConfig::default()
            .with_sweep_interval(Duration::from_millis(10))
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(5))),
    )
}

async fn wait_for_status(engine: &Engine, id: Uuid, status: InstanceStatus) -> Instance {
    for _ in 0..500 {
        let instance = engine.get_instance(id).await.unwrap();
        assert_derived(&instance);
        if instance.status == status {
            return instance;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let instance = engine.get_instance(id).await.unwrap();
    panic!(
        "instance never reached {status}; currently {} with tasks {:?}",
        instance.status,
        instance
            .task_states
            .iter()
            .map(|(id, s)| (id.clone(), s.status))
            .collect::<Vec<_>>()
    );
}

async fn wait_for_task_waiting(engine: &Engine, id: Uuid, task_id: &str) -> Instance {
    for _ in 0..500 {
        let instance = engine.get_instance(id).await.unwrap();
        assert_derived(&instance);
        if instance.task_state(task_id).map(|s| s.status) == Some(TaskStatus::Waiting) {
            return instance;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached waiting");
}

/// Instance status must always equal the derivation over its task table
fn assert_derived(instance: &Instance) {
    assert_eq!(
        instance.status,
        derive_status(&instance.task_states),
        "status drifted from task-state derivation"
    );
}

fn obj(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

/// collect(form) >> validate(fn) >> approve(human) >> finalize(fn)
fn certificate_dag() -> Dag {
    let collect = UserInputOperator::new(
        "collect",
        FormConfig::new(
            "Datos Personales",
            vec![
                FormField::required("name", "text"),
                FormField::required("email", "email"),
            ],
        ),
    )
    .unwrap();

    let validate = FnOperator::new("validate", |ctx| {
        let name = ctx
            .get_path("collect_data.name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("no name collected"))?;
        Ok(obj(json!({
            "validation_valid": true,
            "validation_name": name,
        })))
    })
    .shim();

    let approve = ApprovalOperator::new("approve")
        .approver_user("u1")
        .review_keys(["collect_data", "validation_valid"]);

    let finalize = FnOperator::new("finalize", |ctx| {
        if ctx.get("approve_approved") != Some(&json!(true)) {
            return Err(anyhow!("not approved"));
        }
        Ok(obj(json!({ "certificate_id": "CERT-0001", "certificate_status": "active" })))
    })
    .shim();

    DagBuilder::new("certificate")
        .description("Certificado simple")
        .task(collect)
        .task(validate)
        .task(approve)
        .task(finalize)
        .chain(["collect", "validate", "approve", "finalize"])
        .build()
        .unwrap()
}

// ============================================================================
// S1: linear human-input workflow
// ============================================================================

#[tokio::test]
async fn s1_linear_human_input_workflow() {
    let engine = test_engine();
    engine.register_dag(certificate_dag()).await.unwrap();
    engine.start().unwrap();

    let id = engine
        .create_instance("certificate", "citizen-1", None)
        .await
        .unwrap();

    // No input yet: paused on collect
    let instance = wait_for_task_waiting(&engine, id, "collect").await;
    assert_eq!(instance.status, InstanceStatus::Paused);
    assert_eq!(
        instance.task_state("collect").unwrap().waiting_for.as_deref(),
        Some("user_input")
    );

    // Deliver the form: validate runs, approve suspends
    engine
        .deliver_input(id, "collect", json!({"name": "A", "email": "a@x"}))
        .await
        .unwrap();

    let instance = wait_for_task_waiting(&engine, id, "approve").await;
    assert_eq!(instance.status, InstanceStatus::Paused);
    assert_eq!(instance.context.get("validation_valid"), Some(&json!(true)));
    assert_eq!(
        instance.task_state("approve").unwrap().waiting_for.as_deref(),
        Some("approval")
    );
    assert_eq!(
        instance.task_state("approve").unwrap().assigned_to.as_deref(),
        Some("u1")
    );

    // Approve: finalize runs and the instance completes
    engine
        .deliver_decision(id, "approve", DecisionPayload::approved("u1"))
        .await
        .unwrap();

    let instance = wait_for_status(&engine, id, InstanceStatus::Completed).await;
    assert_eq!(instance.context.get("certificate_id"), Some(&json!("CERT-0001")));
    assert_eq!(instance.context.get("approve_decided_by"), Some(&json!("u1")));
    for task in ["collect", "validate", "approve", "finalize"] {
        assert_eq!(
            instance.task_state(task).unwrap().status,
            TaskStatus::Completed,
            "task {task} should be completed"
        );
    }

    engine.shutdown().await;
}

// ============================================================================
// S2: rejection fails the instance, downstream never runs
// ============================================================================

#[tokio::test]
async fn s2_rejection_fails_instance_and_fires_failure_hook() {
    let engine = test_engine();
    engine.register_dag(certificate_dag()).await.unwrap();

    // Listener workflow observing failures
    let on_failure = DagBuilder::new("on_failure")
        .task(
            FnOperator::new("record", |ctx| {
                let failed = ctx
                    .get("failed_dag")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                Ok(obj(json!({ "record_failed_dag": failed })))
            })
            .shim(),
        )
        .build()
        .unwrap();
    engine.register_dag(on_failure).await.unwrap();
    engine.register_hook(
        Hook::new("notify-on-failure", "^WORKFLOW_FAILED$", "on_failure")
            .unwrap()
            .map_context("dag_id", "failed_dag")
            .map_context("error", "failure_reason"),
    );
    engine.start().unwrap();

    let id = engine
        .create_instance("certificate", "citizen-1", None)
        .await
        .unwrap();

    wait_for_task_waiting(&engine, id, "collect").await;
    engine
        .deliver_input(id, "collect", json!({"name": "A", "email": "a@x"}))
        .await
        .unwrap();
    wait_for_task_waiting(&engine, id, "approve").await;

    engine
        .deliver_decision(
            id,
            "approve",
            DecisionPayload::rejected("u1", "documentos incompletos"),
        )
        .await
        .unwrap();

    let instance = wait_for_status(&engine, id, InstanceStatus::Failed).await;
    let approve = instance.task_state("approve").unwrap();
    assert_eq!(approve.status, TaskStatus::Failed);
    assert!(approve.error_message.as_ref().unwrap().contains("documentos incompletos"));

    // finalize never ran
    assert_eq!(
        instance.task_state("finalize").unwrap().status,
        TaskStatus::Pending
    );
    assert!(instance.task_state("finalize").unwrap().output.is_none());

    // WORKFLOW_FAILED created the listener instance
    let mut listener = None;
    for _ in 0..200 {
        let found = engine
            .list_instances(InstanceFilter::by_dag("on_failure"), Pagination::default())
            .await
            .unwrap();
        if let Some(candidate) = found.first() {
            if candidate.status == InstanceStatus::Completed {
                listener = Some(candidate.clone());
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let listener = listener.expect("failure listener should have run");
    assert_eq!(listener.parent_instance_id, Some(id));
    assert_eq!(
        listener.context.get("record_failed_dag"),
        Some(&json!("certificate"))
    );
    assert_eq!(
        listener.triggering_event.as_ref().unwrap().event_type,
        event::WORKFLOW_FAILED
    );

    engine.shutdown().await;
}

// ============================================================================
// S3: parallel fan-out-in
// ============================================================================

#[tokio::test]
async fn s3_fan_out_in_merges_all_branches() {
    fn marker(task_id: &str) -> impl Operator {
        let id = task_id.to_string();
        let key = format!("{task_id}_mark");
        FnOperator::new(id, move |_| {
            let mut data = Map::new();
            data.insert(key.clone(), Value::Bool(true));
            Ok(data)
        })
        .shim()
    }

    let join = FnOperator::new("e", |ctx| {
        for branch in ["b", "c", "d"] {
            let key = format!("{branch}_mark");
            if ctx.get(&key) != Some(&json!(true)) {
                return Err(anyhow!("branch output missing: {key}"));
            }
        }
        Ok(obj(json!({ "e_joined": true })))
    })
    .shim();

    let dag = DagBuilder::new("fan")
        .task(marker("a"))
        .task(marker("b"))
        .task(marker("c"))
        .task(marker("d"))
        .task(join)
        .fan_out("a", ["b", "c", "d"])
        .fan_in(["b", "c", "d"], "e")
        .build()
        .unwrap();

    let engine = test_engine();
    engine.register_dag(dag).await.unwrap();
    engine.start().unwrap();

    let id = engine.create_instance("fan", "citizen-1", None).await.unwrap();
    let instance = wait_for_status(&engine, id, InstanceStatus::Completed).await;

    // The join observed every branch output
    assert_eq!(instance.context.get("e_joined"), Some(&json!(true)));
    for branch in ["b", "c", "d"] {
        assert_eq!(
            instance.task_state(branch).unwrap().status,
            TaskStatus::Completed
        );
    }

    engine.shutdown().await;
}

// ============================================================================
// S4: remote poll survives suspension
// ============================================================================

/// Remote runner returning Running once, then Success
struct TwoPhaseRunner {
    triggers: Mutex<Vec<String>>,
    polls: AtomicU32,
}

#[async_trait]
impl RemoteDagClient for TwoPhaseRunner {
    async fn trigger_run(&self, _dag_id: &str, run_id: &str, _conf: Value) -> anyhow::Result<()> {
        self.triggers.lock().push(run_id.to_string());
        Ok(())
    }

    async fn run_state(&self, _dag_id: &str, _run_id: &str) -> anyhow::Result<RemoteRunState> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(if poll == 0 {
            RemoteRunState::Running
        } else {
            RemoteRunState::Success
        })
    }
}

#[tokio::test]
async fn s4_remote_poll_state_survives_suspension() {
    let runner = Arc::new(TwoPhaseRunner {
        triggers: Mutex::new(vec![]),
        polls: AtomicU32::new(0),
    });

    let dag = DagBuilder::new("external_sync")
        .task(
            RemoteDagOperator::new("sync", "catastro_sync", runner.clone())
                .with_poll_interval(Duration::from_millis(30))
                .with_timeout(Duration::from_secs(60)),
        )
        .build()
        .unwrap();

    let engine = test_engine();
    engine.register_dag(dag).await.unwrap();
    engine.start().unwrap();

    let id = engine
        .create_instance("external_sync", "citizen-1", None)
        .await
        .unwrap();

    // First execution triggered the run and parked with its state durable
    let instance = wait_for_task_waiting(&engine, id, "sync").await;
    let persisted_run_id = instance
        .context
        .get_path("sync_state.run_id")
        .and_then(Value::as_str)
        .expect("run id persisted before suspension")
        .to_string();
    assert!(instance.context.get_path("sync_state.last_check").is_some());
    assert!(instance
        .task_state("sync")
        .unwrap()
        .waiting_for
        .as_deref()
        .unwrap()
        .starts_with("external_poll:"));

    // Timed wakes poll until success; the same run id flows through
    let instance = wait_for_status(&engine, id, InstanceStatus::Completed).await;
    assert_eq!(
        instance.context.get("sync_run_id"),
        Some(&json!(persisted_run_id))
    );
    assert_eq!(instance.context.get("sync_final_state"), Some(&json!("success")));
    assert_eq!(runner.triggers.lock().len(), 1, "run must not be re-triggered");
    assert!(runner.polls.load(Ordering::SeqCst) >= 2);

    engine.shutdown().await;
}

// ============================================================================
// S5: hook chain creates a listener instance with mapped context
// ============================================================================

#[tokio::test]
async fn s5_entity_created_hook_spawns_listener() {
    let entities = Arc::new(InMemoryEntityStore::new());

    let producer = DagBuilder::new("register_property")
        .emits_events(true)
        .entity_output("property_record")
        .task(CreateEntityOperator::new(
            "create",
            "property_record",
            "property_data",
            entities.clone(),
        ))
        .build()
        .unwrap();

    let listener = DagBuilder::new("index_property")
        .listens_to_events(true)
        .task(
            FnOperator::new("index", |ctx| {
                let entity_id = ctx
                    .get("source_entity_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("no entity id mapped"))?;
                Ok(obj(json!({ "index_entity_id": entity_id })))
            })
            .shim(),
        )
        .build()
        .unwrap();

    let engine = test_engine();
    engine.register_dag(producer).await.unwrap();
    engine.register_dag(listener).await.unwrap();
    engine.register_hook(
        Hook::new("index-on-create", r"^ENTITY_CREATED\..*", "index_property")
            .unwrap()
            .with_source("register_property")
            .map_context("entity_id", "source_entity_id")
            .map_context("owner_user_id", "owner_user_id"),
    );
    engine.start().unwrap();

    let id = engine
        .create_instance(
            "register_property",
            "citizen-1",
            Some(obj(json!({
                "owner_user_id": "citizen-1",
                "property_data": { "clave_catastral": "064-123" }
            }))),
        )
        .await
        .unwrap();

    let producer_instance = wait_for_status(&engine, id, InstanceStatus::Completed).await;
    let entity_id = producer_instance
        .context
        .get("create_entity_id")
        .and_then(Value::as_str)
        .unwrap()
        .to_string();

    // Exactly one listener instance, seeded through the context mapping
    let mut listener_instance = None;
    for _ in 0..200 {
        let found = engine
            .list_instances(InstanceFilter::by_dag("index_property"), Pagination::default())
            .await
            .unwrap();
        if found.len() == 1 && found[0].status == InstanceStatus::Completed {
            listener_instance = Some(found[0].clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let listener_instance = listener_instance.expect("listener should complete");

    assert_eq!(listener_instance.parent_instance_id, Some(id));
    assert_eq!(
        listener_instance.context.get("index_entity_id"),
        Some(&json!(entity_id))
    );
    assert_eq!(listener_instance.owner_user_id, "citizen-1");
    let trigger = listener_instance.triggering_event.as_ref().unwrap();
    assert_eq!(trigger.event_type, "ENTITY_CREATED.property_record");
    assert_eq!(trigger.source_instance_id, id);

    engine.shutdown().await;
}

// ============================================================================
// S6: retry escalates to failure at the attempt cap
// ============================================================================

struct AlwaysRetries {
    executions: Arc<AtomicU32>,
}

#[async_trait]
impl Operator for AlwaysRetries {
    fn task_id(&self) -> &str {
        "flaky"
    }

    fn operator_type(&self) -> &'static str {
        "always_retries"
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    async fn execute(&self, _ctx: &mut TaskContext<'_>) -> TaskResult {
        self.executions.fetch_add(1, Ordering::SeqCst);
        TaskResult::retry_after("upstream unavailable", Duration::from_millis(5))
    }
}

#[tokio::test]
async fn s6_retry_cap_escalates_to_failure() {
    let executions = Arc::new(AtomicU32::new(0));
    let dag = DagBuilder::new("flaky_wf")
        .task(AlwaysRetries {
            executions: executions.clone(),
        })
        .build()
        .unwrap();

    let engine = test_engine();
    engine.register_dag(dag).await.unwrap();
    engine.start().unwrap();

    let id = engine.create_instance("flaky_wf", "citizen-1", None).await.unwrap();
    let instance = wait_for_status(&engine, id, InstanceStatus::Failed).await;

    let state = instance.task_state("flaky").unwrap();
    assert_eq!(state.attempt_count, 4, "three retries then the failing attempt");
    assert_eq!(executions.load(Ordering::SeqCst), 4);
    assert!(state
        .error_message
        .as_ref()
        .unwrap()
        .contains("max_attempts exceeded"));

    engine.shutdown().await;
}

// ============================================================================
// Waiting-task timeout converts to failure
// ============================================================================

#[tokio::test]
async fn waiting_task_times_out_to_failure() {
    let dag = DagBuilder::new("slow_form")
        .task(
            UserInputOperator::new(
                "collect",
                FormConfig::new("Datos", vec![FormField::required("name", "text")]),
            )
            .unwrap()
            .with_timeout(Duration::from_millis(80)),
        )
        .build()
        .unwrap();

    let engine = test_engine();
    engine.register_dag(dag).await.unwrap();
    engine.start().unwrap();

    let id = engine.create_instance("slow_form", "citizen-1", None).await.unwrap();
    wait_for_task_waiting(&engine, id, "collect").await;

    let instance = wait_for_status(&engine, id, InstanceStatus::Failed).await;
    let state = instance.task_state("collect").unwrap();
    assert!(state.error_message.as_ref().unwrap().contains("timeout"));

    engine.shutdown().await;
}

// ============================================================================
// Concurrent instances stay isolated
// ============================================================================

#[tokio::test]
async fn concurrent_instances_have_disjoint_contexts() {
    let dag = DagBuilder::new("echo")
        .task(
            FnOperator::new("echo", |ctx| {
                let seed = ctx
                    .get("seed")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("no seed"))?;
                Ok(obj(json!({ "echo_value": seed })))
            })
            .shim(),
        )
        .build()
        .unwrap();

    let engine = test_engine();
    engine.register_dag(dag).await.unwrap();
    engine.start().unwrap();

    let mut ids = vec![];
    for n in 0..8 {
        let seed = format!("seed-{n}");
        let id = engine
            .create_instance("echo", &format!("citizen-{n}"), Some(obj(json!({ "seed": seed }))))
            .await
            .unwrap();
        ids.push((id, format!("seed-{n}")));
    }

    for (id, seed) in ids {
        let instance = wait_for_status(&engine, id, InstanceStatus::Completed).await;
        assert_eq!(instance.context.get("echo_value"), Some(&json!(seed)));
        assert_eq!(instance.context.len(), 2, "only own seed and own output");
    }

    engine.shutdown().await;
}

// ============================================================================
// Hook chains are depth-bounded
// ============================================================================

/// Emits the very event type the workflow's own hook listens to
struct ReEmits;

#[async_trait]
impl Operator for ReEmits {
    fn task_id(&self) -> &str {
        "emit"
    }

    fn operator_type(&self) -> &'static str {
        "re_emits"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
        ctx.emit_event(
            "ENTITY_CREATED.loop_record",
            obj(json!({ "owner_user_id": "citizen-1" })),
        );
        TaskResult::done_empty()
    }
}

#[tokio::test]
async fn hook_chain_depth_is_bounded() {
    // A workflow that re-emits the event its own hook listens to
    let looping = DagBuilder::new("looping")
        .emits_events(true)
        .listens_to_events(true)
        .task(ReEmits)
        .build()
        .unwrap();

    let store = Arc::new(InMemoryInstanceStore::new());
    let engine = Engine::with_config(
        store,
        EngineConfig::default()
            .with_sweep_interval(Duration::from_millis(10))
            .with_hook_depth_limit(3),
    );
    engine.register_dag(looping).await.unwrap();
    engine.register_hook(
        Hook::new("self-loop", r"^ENTITY_CREATED\.loop_record$", "looping")
            .unwrap()
            .map_context("owner_user_id", "owner_user_id"),
    );
    engine.start().unwrap();

    let root = engine
        .create_instance("looping", "citizen-1", None)
        .await
        .unwrap();
    wait_for_status(&engine, root, InstanceStatus::Completed).await;

    // Let the chain play out, then confirm it stopped at the depth bound:
    // depths 0..=3 gives four instances in total.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let all = engine
        .list_instances(InstanceFilter::by_dag("looping"), Pagination::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 4, "root plus three hook generations");
    let max_depth = all.iter().map(|i| i.hook_depth).max().unwrap();
    assert_eq!(max_depth, 3);

    engine.shutdown().await;
}

// ============================================================================
// Cancellation reaches cancelled from a suspended state
// ============================================================================

#[tokio::test]
async fn cancellation_liveness_from_waiting() {
    let engine = test_engine();
    engine.register_dag(certificate_dag()).await.unwrap();
    engine.start().unwrap();

    let id = engine
        .create_instance("certificate", "citizen-1", None)
        .await
        .unwrap();
    wait_for_task_waiting(&engine, id, "collect").await;

    engine.cancel_instance(id).await.unwrap();
    let instance = wait_for_status(&engine, id, InstanceStatus::Cancelled).await;

    for task in ["collect", "validate", "approve", "finalize"] {
        assert_eq!(
            instance.task_state(task).unwrap().status,
            TaskStatus::Cancelled
        );
    }

    engine.shutdown().await;
}

// ============================================================================
// Externally injected events flow through the hook registry
// ============================================================================

#[tokio::test]
async fn emit_event_api_reaches_hooks() {
    let engine = test_engine();
    let listener = DagBuilder::new("audit")
        .task(
            FnOperator::new("note", |ctx| {
                Ok(obj(json!({
                    "note_kind": ctx.get("kind").cloned().unwrap_or(Value::Null)
                })))
            })
            .shim(),
        )
        .build()
        .unwrap();
    engine.register_dag(listener).await.unwrap();
    engine.register_hook(
        Hook::new("audit-all", r"^catalog\..*", "audit")
            .unwrap()
            .map_context("kind", "kind"),
    );
    engine.start().unwrap();

    let created = engine
        .emit_event(Event::new(
            "catalog.refreshed",
            "catalog_service",
            Uuid::now_v7(),
            obj(json!({ "kind": "full" })),
        ))
        .await
        .unwrap();
    assert_eq!(created, 1);

    let found = engine
        .list_instances(InstanceFilter::by_dag("audit"), Pagination::default())
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    engine.shutdown().await;
}
