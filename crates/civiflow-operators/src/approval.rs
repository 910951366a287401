//! Human approval
//!
//! An approval task assigns itself to an approver, emits
//! `APPROVAL_REQUESTED`, and suspends until a decision is delivered.
//! Approval publishes the decision into the context; rejection fails the
//! task (and with it the instance). An operator configured with
//! auto-approve applies the approval itself when its window expires,
//! instead of the engine timing the task out.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use civiflow_core::context::input_key;
use civiflow_core::event;
use civiflow_core::operator::{waiting_for, Operator, TaskContext, TaskResult};

/// State the operator round-trips through its context slot
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApprovalState {
    requested_at: DateTime<Utc>,
}

/// Waits for a human approval decision
pub struct ApprovalOperator {
    task_id: String,
    approver_user: Option<String>,
    approver_role: Option<String>,
    message: String,
    context_keys_to_review: Vec<String>,
    timeout: Option<Duration>,
    auto_approve_on_timeout: bool,
}

impl ApprovalOperator {
    /// Create an approval operator
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            approver_user: None,
            approver_role: None,
            message: "Se requiere aprobación para continuar".to_string(),
            context_keys_to_review: vec![],
            timeout: Some(Duration::from_secs(48 * 60 * 60)),
            auto_approve_on_timeout: false,
        }
    }

    /// Require approval from a specific user
    pub fn approver_user(mut self, user: impl Into<String>) -> Self {
        self.approver_user = Some(user.into());
        self
    }

    /// Require approval from a role; a `region` context value scopes the
    /// team (`"{role}_{region}"`)
    pub fn approver_role(mut self, role: impl Into<String>) -> Self {
        self.approver_role = Some(role.into());
        self
    }

    /// Message shown to the approver
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Context keys (dot-paths allowed) presented for review
    pub fn review_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context_keys_to_review = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the approval window
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Auto-approve when the window expires instead of failing
    pub fn auto_approve_on_timeout(mut self) -> Self {
        self.auto_approve_on_timeout = true;
        self
    }

    fn resolve_assignee(&self, ctx: &TaskContext<'_>) -> String {
        if let Some(user) = &self.approver_user {
            return user.clone();
        }
        if let Some(role) = &self.approver_role {
            return match ctx.get("region").and_then(Value::as_str) {
                Some(region) => format!("{role}_{region}"),
                None => role.clone(),
            };
        }
        "approvers".to_string()
    }

    /// Context slice the approver reviews; the whole propagatable context
    /// when no keys were configured
    fn review_data(&self, ctx: &TaskContext<'_>) -> Map<String, Value> {
        if self.context_keys_to_review.is_empty() {
            return ctx.context().child_seed();
        }
        let mut review = Map::new();
        for key in &self.context_keys_to_review {
            if let Some(value) = ctx.get_path(key) {
                review.insert(key.clone(), value.clone());
            }
        }
        review
    }

    fn approve(
        &self,
        ctx: &mut TaskContext<'_>,
        decided_by: &str,
        comments: Option<&str>,
        auto: bool,
    ) -> TaskResult {
        let mut payload = Map::new();
        payload.insert("task_id".to_string(), Value::String(self.task_id.clone()));
        payload.insert("decision".to_string(), Value::String("approved".to_string()));
        payload.insert("decided_by".to_string(), Value::String(decided_by.to_string()));
        ctx.emit_event(event::APPROVAL_DECIDED, payload);

        let mut data = Map::new();
        data.insert(format!("{}_approved", self.task_id), Value::Bool(true));
        data.insert(
            format!("{}_decided_by", self.task_id),
            Value::String(decided_by.to_string()),
        );
        if let Some(comments) = comments {
            data.insert(
                format!("{}_comments", self.task_id),
                Value::String(comments.to_string()),
            );
        }
        if auto {
            data.insert(format!("{}_auto_approved", self.task_id), Value::Bool(true));
        }
        TaskResult::done(data)
    }
}

#[async_trait]
impl Operator for ApprovalOperator {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn operator_type(&self) -> &'static str {
        "approval"
    }

    fn timeout(&self) -> Option<Duration> {
        // With auto-approve the operator owns the expiry path.
        if self.auto_approve_on_timeout {
            None
        } else {
            self.timeout
        }
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
        let assignee = self.resolve_assignee(ctx);
        ctx.assign_to(assignee.clone());

        // A delivered decision takes precedence over everything else.
        if let Some(decision) = ctx.input().filter(|v| !v.is_null()).cloned() {
            let decided_by = decision
                .get("decided_by")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let comments = decision
                .get("comments")
                .and_then(Value::as_str)
                .map(str::to_string);

            return match decision.get("decision").and_then(Value::as_str) {
                Some("approved") => {
                    ctx.log_info("approval granted", None);
                    self.approve(ctx, &decided_by, comments.as_deref(), false)
                }
                Some("rejected") => {
                    let reason = decision
                        .get("rejection_reason")
                        .and_then(Value::as_str)
                        .unwrap_or("no reason given");
                    let mut payload = Map::new();
                    payload.insert("task_id".to_string(), Value::String(self.task_id.clone()));
                    payload.insert(
                        "decision".to_string(),
                        Value::String("rejected".to_string()),
                    );
                    payload.insert("decided_by".to_string(), Value::String(decided_by.clone()));
                    ctx.emit_event(event::APPROVAL_DECIDED, payload);
                    TaskResult::failed(format!("rejected by {decided_by}: {reason}"))
                }
                other => {
                    ctx.log_warning("unrecognized decision", Some(&decision));
                    let mut data = Map::new();
                    data.insert(input_key(&self.task_id), Value::Null);
                    data.insert(
                        format!("{}_decision_error", self.task_id),
                        Value::String(format!("unrecognized decision: {other:?}")),
                    );
                    TaskResult::waiting(data, waiting_for::APPROVAL)
                }
            };
        }

        let state: Option<ApprovalState> = ctx
            .state()
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let now = Utc::now();

        if let Some(state) = &state {
            if self.auto_approve_on_timeout {
                if let Some(timeout) = self.timeout {
                    let elapsed = (now - state.requested_at)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    if elapsed >= timeout {
                        ctx.log_info("approval window expired, auto-approving", None);
                        return self.approve(ctx, "system_timeout", None, true);
                    }
                    // Re-wait only for the remainder of the window.
                    return TaskResult::waiting_with_delay(
                        Map::new(),
                        waiting_for::APPROVAL,
                        timeout - elapsed,
                    );
                }
            }
            return TaskResult::waiting(Map::new(), waiting_for::APPROVAL);
        }

        // First entry: request the approval.
        let review = self.review_data(ctx);
        let mut payload = Map::new();
        payload.insert("task_id".to_string(), Value::String(self.task_id.clone()));
        payload.insert("assigned_to".to_string(), Value::String(assignee));
        payload.insert("message".to_string(), Value::String(self.message.clone()));
        payload.insert(
            "data_under_review".to_string(),
            Value::Object(review.clone()),
        );
        ctx.emit_event(event::APPROVAL_REQUESTED, payload);
        ctx.log_info("approval requested", None);

        let mut data = Map::new();
        data.insert(
            ctx.state_key(),
            serde_json::to_value(ApprovalState { requested_at: now }).unwrap_or(Value::Null),
        );
        data.insert(
            format!("{}_review", self.task_id),
            Value::Object(review),
        );
        match (self.auto_approve_on_timeout, self.timeout) {
            (true, Some(timeout)) => {
                TaskResult::waiting_with_delay(data, waiting_for::APPROVAL, timeout)
            }
            _ => TaskResult::waiting(data, waiting_for::APPROVAL),
        }
    }
}
