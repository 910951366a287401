//! Operator contract
//!
//! An operator is one self-contained unit of work in a DAG. It knows
//! nothing about the workflow structure around it; it reads the instance
//! context, does its work, and reports an outcome. All per-attempt state
//! lives in the context, never on the operator value itself, so one
//! operator serves any number of concurrent instances.

mod context;
mod result;

pub use context::TaskContext;
pub use result::{waiting_for, TaskResult};

use std::time::Duration;

use async_trait::async_trait;

/// A unit of work within a DAG
///
/// Operators are shared across instances (`Arc<dyn Operator>` in the DAG),
/// so implementations must be stateless with respect to execution: retry
/// counters, poll timestamps, and remote run ids round-trip through the
/// context via the task's state slot.
///
/// Implementations must not panic out of `execute`; the executor traps
/// panics as a last resort and converts them to terminal task failure,
/// but the contract is to return [`TaskResult::Retry`] or
/// [`TaskResult::Failed`].
///
/// # Example
///
/// ```ignore
/// struct ValidateAddress;
///
/// #[async_trait]
/// impl Operator for ValidateAddress {
///     fn task_id(&self) -> &str { "validate_address" }
///     fn operator_type(&self) -> &'static str { "validate_address" }
///
///     async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
///         let Some(address) = ctx.get_path("collect_data.address") else {
///             return TaskResult::failed("no address collected");
///         };
///         // validate...
///         TaskResult::done(json!({ "validate_address_valid": true })
///             .as_object().cloned().unwrap())
///     }
/// }
/// ```
#[async_trait]
pub trait Operator: Send + Sync + 'static {
    /// Unique id of this task within its DAG
    fn task_id(&self) -> &str;

    /// Discriminator naming the operator kind (`"user_input"`,
    /// `"approval"`, `"remote_dag"`, ...)
    fn operator_type(&self) -> &'static str;

    /// Execute one attempt of this task
    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult;

    /// Attempt cap for `Retry` results before the task fails
    fn max_attempts(&self) -> u32 {
        3
    }

    /// Wall-clock timeout, measured from the task's first `Waiting`
    /// transition. `None` disables the engine-level timeout; operators
    /// with their own timeout policy (auto-approve) return `None` and
    /// handle expiry inside `execute`.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Synchronous operator for CPU-only work
///
/// A shim over [`Operator`] for tasks with no I/O: implement the blocking
/// `call` and wrap the value in [`SyncShim`] to place it in a DAG.
pub trait SyncOperator: Send + Sync + 'static {
    /// Unique id of this task within its DAG
    fn task_id(&self) -> &str;

    /// Discriminator naming the operator kind
    fn operator_type(&self) -> &'static str;

    /// Execute one attempt synchronously
    fn call(&self, ctx: &mut TaskContext<'_>) -> TaskResult;

    /// Attempt cap for `Retry` results
    fn max_attempts(&self) -> u32 {
        3
    }
}

/// Adapter presenting a [`SyncOperator`] as an [`Operator`]
pub struct SyncShim<O: SyncOperator>(pub O);

#[async_trait]
impl<O: SyncOperator> Operator for SyncShim<O> {
    fn task_id(&self) -> &str {
        self.0.task_id()
    }

    fn operator_type(&self) -> &'static str {
        self.0.operator_type()
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
        self.0.call(ctx)
    }

    fn max_attempts(&self) -> u32 {
        self.0.max_attempts()
    }
}
