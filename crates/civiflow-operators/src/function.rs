//! Closure-backed operator for CPU-only steps

use std::sync::Arc;

use serde_json::{Map, Value};

use civiflow_core::context::Context;
use civiflow_core::operator::{SyncOperator, SyncShim, TaskContext, TaskResult};

type TaskFn = dyn Fn(&Context) -> anyhow::Result<Map<String, Value>> + Send + Sync;

/// Runs a plain function against the context
///
/// The function receives the accumulated context and returns the output
/// map to merge; an `Err` becomes a terminal task failure. For transient
/// failures or suspension semantics, implement
/// [`Operator`](civiflow_core::operator::Operator) directly.
///
/// # Example
///
/// ```ignore
/// let validate = FnOperator::new("validate", |ctx| {
///     let data = ctx.get("collect_data").ok_or_else(|| anyhow!("nothing collected"))?;
///     Ok(json!({ "validate_valid": true }).as_object().cloned().unwrap())
/// })
/// .shim();
/// ```
pub struct FnOperator {
    task_id: String,
    func: Arc<TaskFn>,
}

impl FnOperator {
    /// Create a function operator
    pub fn new<F>(task_id: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Context) -> anyhow::Result<Map<String, Value>> + Send + Sync + 'static,
    {
        Self {
            task_id: task_id.into(),
            func: Arc::new(func),
        }
    }

    /// Wrap into the async operator contract
    pub fn shim(self) -> SyncShim<Self> {
        SyncShim(self)
    }
}

impl SyncOperator for FnOperator {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn operator_type(&self) -> &'static str {
        "function"
    }

    fn call(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
        match (self.func)(ctx.context()) {
            Ok(data) => TaskResult::done(data),
            Err(error) => TaskResult::failed(error.to_string()),
        }
    }
}
