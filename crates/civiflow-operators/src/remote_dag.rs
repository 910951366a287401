//! Remote DAG trigger-and-poll
//!
//! Triggers a run on an external DAG runner and monitors it without
//! holding a worker: each poll is one short execution, and everything the
//! next poll needs (run id, trigger time, last check) rides in the
//! context through the operator's state slot. The engine wakes the task
//! on the configured poll interval via `retry_delay`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use civiflow_core::operator::{waiting_for, Operator, TaskContext, TaskResult};

/// State of a run on the remote runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteRunState {
    Queued,
    Running,
    Success,
    Failed,
}

impl RemoteRunState {
    /// Parse a runner-reported state string
    pub fn parse(state: &str) -> Self {
        match state {
            "success" => Self::Success,
            "failed" => Self::Failed,
            "running" => Self::Running,
            _ => Self::Queued,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Client for an external DAG runner
///
/// The runner is an external collaborator; the engine only consumes this
/// interface.
#[async_trait]
pub trait RemoteDagClient: Send + Sync + 'static {
    /// Start a run with the given id and configuration
    async fn trigger_run(&self, dag_id: &str, run_id: &str, conf: Value) -> anyhow::Result<()>;

    /// Report the current state of a run
    async fn run_state(&self, dag_id: &str, run_id: &str) -> anyhow::Result<RemoteRunState>;
}

/// HTTP client for an Airflow-style REST API
pub struct HttpRemoteDagClient {
    base_url: String,
    username: String,
    password: String,
    client: Client,
}

impl HttpRemoteDagClient {
    /// Create a client against `{base_url}/dags/...`
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl RemoteDagClient for HttpRemoteDagClient {
    async fn trigger_run(&self, dag_id: &str, run_id: &str, conf: Value) -> anyhow::Result<()> {
        let url = format!("{}/dags/{dag_id}/dagRuns", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({ "dag_run_id": run_id, "conf": conf }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("trigger returned HTTP {status}");
        }
        Ok(())
    }

    async fn run_state(&self, dag_id: &str, run_id: &str) -> anyhow::Result<RemoteRunState> {
        let url = format!("{}/dags/{dag_id}/dagRuns/{run_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("status check returned HTTP {status}");
        }

        let body: Value = response.json().await?;
        let state = body.get("state").and_then(Value::as_str).unwrap_or("queued");
        Ok(RemoteRunState::parse(state))
    }
}

/// State round-tripped through the context across suspensions
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PollState {
    run_id: String,
    triggered_at: DateTime<Utc>,
    last_check: DateTime<Utc>,
    status: String,
}

/// Triggers a remote DAG run and polls it to completion
pub struct RemoteDagOperator {
    task_id: String,
    remote_dag_id: String,
    client: Arc<dyn RemoteDagClient>,
    timeout: Duration,
    poll_interval: Duration,
}

impl RemoteDagOperator {
    /// Create a remote-DAG operator
    pub fn new(
        task_id: impl Into<String>,
        remote_dag_id: impl Into<String>,
        client: Arc<dyn RemoteDagClient>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            remote_dag_id: remote_dag_id.into(),
            client,
            timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(10),
        }
    }

    /// Overall deadline for the remote run
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Minimum interval between status checks
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn waiting_with_state(&self, ctx: &TaskContext<'_>, state: &PollState, delay: Duration) -> TaskResult {
        let mut data = Map::new();
        data.insert(
            ctx.state_key(),
            serde_json::to_value(state).unwrap_or(Value::Null),
        );
        TaskResult::waiting_with_delay(
            data,
            waiting_for::external_poll(self.operator_type()),
            delay,
        )
    }

    async fn trigger(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
        let run_id = format!(
            "civiflow_{}_{}",
            self.task_id,
            Uuid::now_v7().simple()
        );
        let conf = ctx
            .get(&format!("{}_conf", self.task_id))
            .cloned()
            .unwrap_or_else(|| json!({}));

        ctx.log_info(
            "triggering remote dag run",
            Some(&json!({ "dag_id": self.remote_dag_id, "run_id": run_id })),
        );

        if let Err(error) = self
            .client
            .trigger_run(&self.remote_dag_id, &run_id, conf)
            .await
        {
            ctx.log_error("failed to trigger remote dag", Some(&json!(error.to_string())));
            return TaskResult::failed(format!(
                "failed to trigger remote dag {}: {error}",
                self.remote_dag_id
            ));
        }

        let now = Utc::now();
        let state = PollState {
            run_id,
            triggered_at: now,
            last_check: now,
            status: "triggered".to_string(),
        };
        self.waiting_with_state(ctx, &state, self.poll_interval)
    }

    async fn poll(&self, ctx: &mut TaskContext<'_>, mut state: PollState) -> TaskResult {
        let now = Utc::now();
        let elapsed = (now - state.triggered_at).to_std().unwrap_or(Duration::ZERO);
        if elapsed > self.timeout {
            ctx.log_error(
                "remote dag run timed out",
                Some(&json!({ "run_id": state.run_id })),
            );
            return TaskResult::failed(format!(
                "remote dag {} timed out after {}s",
                self.remote_dag_id,
                self.timeout.as_secs()
            ));
        }

        // Rate limiting between status checks
        let since_last = (now - state.last_check).to_std().unwrap_or(Duration::ZERO);
        if since_last < self.poll_interval {
            return self.waiting_with_state(ctx, &state, self.poll_interval - since_last);
        }

        let run_state = match self
            .client
            .run_state(&self.remote_dag_id, &state.run_id)
            .await
        {
            Ok(run_state) => run_state,
            Err(error) => {
                // Transient check failure: keep polling.
                ctx.log_warning(
                    "remote dag status check failed, will retry",
                    Some(&json!(error.to_string())),
                );
                state.last_check = now;
                return self.waiting_with_state(ctx, &state, self.poll_interval);
            }
        };

        state.last_check = now;
        state.status = run_state.as_str().to_string();

        match run_state {
            RemoteRunState::Success => {
                ctx.log_info(
                    "remote dag run completed",
                    Some(&json!({ "run_id": state.run_id, "elapsed_seconds": elapsed.as_secs() })),
                );
                let mut data = Map::new();
                data.insert(
                    format!("{}_run_id", self.task_id),
                    Value::String(state.run_id),
                );
                data.insert(
                    format!("{}_final_state", self.task_id),
                    Value::String("success".to_string()),
                );
                data.insert(
                    format!("{}_elapsed_seconds", self.task_id),
                    Value::Number(elapsed.as_secs().into()),
                );
                TaskResult::done(data)
            }
            RemoteRunState::Failed => {
                TaskResult::failed(format!(
                    "remote dag {} run {} failed",
                    self.remote_dag_id, state.run_id
                ))
            }
            RemoteRunState::Queued | RemoteRunState::Running => {
                self.waiting_with_state(ctx, &state, self.poll_interval)
            }
        }
    }
}

#[async_trait]
impl Operator for RemoteDagOperator {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn operator_type(&self) -> &'static str {
        "remote_dag"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
        let state: Option<PollState> = ctx
            .state()
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        match state {
            None => self.trigger(ctx).await,
            Some(state) => self.poll(ctx, state).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civiflow_core::context::{state_key, Context};
    use civiflow_core::event::EventBuffer;
    use parking_lot::Mutex;

    /// Scripted client returning canned states in order
    struct ScriptedClient {
        triggers: Mutex<Vec<String>>,
        states: Mutex<Vec<RemoteRunState>>,
    }

    impl ScriptedClient {
        fn new(states: Vec<RemoteRunState>) -> Self {
            Self {
                triggers: Mutex::new(vec![]),
                states: Mutex::new(states),
            }
        }
    }

    #[async_trait]
    impl RemoteDagClient for ScriptedClient {
        async fn trigger_run(
            &self,
            _dag_id: &str,
            run_id: &str,
            _conf: Value,
        ) -> anyhow::Result<()> {
            self.triggers.lock().push(run_id.to_string());
            Ok(())
        }

        async fn run_state(&self, _dag_id: &str, _run_id: &str) -> anyhow::Result<RemoteRunState> {
            let mut states = self.states.lock();
            if states.is_empty() {
                Ok(RemoteRunState::Running)
            } else {
                Ok(states.remove(0))
            }
        }
    }

    fn operator(client: Arc<ScriptedClient>) -> RemoteDagOperator {
        RemoteDagOperator::new("sync_records", "catastro_sync", client)
            .with_poll_interval(Duration::ZERO)
            .with_timeout(Duration::from_secs(600))
    }

    async fn run(op: &RemoteDagOperator, context: &Context) -> TaskResult {
        let mut events = EventBuffer::new();
        let mut ctx = TaskContext::new("sync_records", 1, context, &mut events);
        op.execute(&mut ctx).await
    }

    #[tokio::test]
    async fn test_first_execution_triggers_and_persists_state() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let op = operator(client.clone());
        let context = Context::new();

        let result = run(&op, &context).await;

        match result {
            TaskResult::Waiting {
                data,
                waiting_for,
                retry_delay,
            } => {
                assert_eq!(waiting_for, "external_poll:remote_dag");
                assert!(retry_delay.is_some());
                let state = data.get(&state_key("sync_records")).unwrap();
                assert!(state.get("run_id").is_some());
                assert_eq!(state.get("status"), Some(&json!("triggered")));
            }
            other => panic!("expected Waiting, got {other:?}"),
        }
        assert_eq!(client.triggers.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_resumed_execution_observes_persisted_run_id() {
        let client = Arc::new(ScriptedClient::new(vec![RemoteRunState::Success]));
        let op = operator(client.clone());

        // Simulate the context as persisted by a prior Waiting result.
        let mut context = Context::new();
        let persisted = PollState {
            run_id: "civiflow_sync_records_r1".to_string(),
            triggered_at: Utc::now() - chrono::Duration::seconds(30),
            last_check: Utc::now() - chrono::Duration::seconds(30),
            status: "triggered".to_string(),
        };
        context.insert(
            state_key("sync_records"),
            serde_json::to_value(&persisted).unwrap(),
        );

        let result = run(&op, &context).await;

        match result {
            TaskResult::Continue { data } => {
                assert_eq!(
                    data.get("sync_records_run_id"),
                    Some(&json!("civiflow_sync_records_r1"))
                );
                assert_eq!(data.get("sync_records_final_state"), Some(&json!("success")));
            }
            other => panic!("expected Continue, got {other:?}"),
        }
        // Second execution polled, it did not re-trigger.
        assert!(client.triggers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_running_state_rewaits_with_updated_check() {
        let client = Arc::new(ScriptedClient::new(vec![RemoteRunState::Running]));
        let op = operator(client);

        let earlier = Utc::now() - chrono::Duration::seconds(60);
        let mut context = Context::new();
        context.insert(
            state_key("sync_records"),
            serde_json::to_value(PollState {
                run_id: "r1".to_string(),
                triggered_at: earlier,
                last_check: earlier,
                status: "triggered".to_string(),
            })
            .unwrap(),
        );

        match run(&op, &context).await {
            TaskResult::Waiting { data, .. } => {
                let state = data.get(&state_key("sync_records")).unwrap();
                assert_eq!(state.get("status"), Some(&json!("running")));
                let last_check: DateTime<Utc> =
                    serde_json::from_value(state.get("last_check").unwrap().clone()).unwrap();
                assert!(last_check > earlier);
            }
            other => panic!("expected Waiting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overall_timeout_fails_the_run() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let op = RemoteDagOperator::new("sync_records", "catastro_sync", client)
            .with_timeout(Duration::from_secs(1));

        let long_ago = Utc::now() - chrono::Duration::seconds(3600);
        let mut context = Context::new();
        context.insert(
            state_key("sync_records"),
            serde_json::to_value(PollState {
                run_id: "r1".to_string(),
                triggered_at: long_ago,
                last_check: long_ago,
                status: "running".to_string(),
            })
            .unwrap(),
        );

        match run(&op, &context).await {
            TaskResult::Failed { error } => assert!(error.contains("timed out")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_remote_run_fails_task() {
        let client = Arc::new(ScriptedClient::new(vec![RemoteRunState::Failed]));
        let op = operator(client);

        let earlier = Utc::now() - chrono::Duration::seconds(60);
        let mut context = Context::new();
        context.insert(
            state_key("sync_records"),
            serde_json::to_value(PollState {
                run_id: "r1".to_string(),
                triggered_at: earlier,
                last_check: earlier,
                status: "running".to_string(),
            })
            .unwrap(),
        );

        match run(&op, &context).await {
            TaskResult::Failed { error } => assert!(error.contains("r1")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
