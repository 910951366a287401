//! # Civiflow Core
//!
//! Data model for the Civiflow workflow engine.
//!
//! A workflow definition is a [`Dag`](dag::Dag) of self-contained
//! [`Operator`](operator::Operator)s. One execution of a DAG for one
//! request is an [`Instance`](instance::Instance), carrying an isolated
//! [`Context`](context::Context) and a per-task state table from which
//! the instance status is derived. Operators report outcomes as
//! [`TaskResult`](operator::TaskResult) values; instances emit
//! [`Event`](event::Event)s which [`Hook`](hook::Hook) rules turn into
//! further instances.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        DagBag                            │
//! │        (immutable workflow definitions, by dag_id)       │
//! └──────────────────────────────────────────────────────────┘
//!                             │ instantiate
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   Instance { context, task_states } — status derived     │
//! └──────────────────────────────────────────────────────────┘
//!                             │ execute / suspend / resume
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   Operator::execute(ctx) → TaskResult                    │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod dag;
pub mod event;
pub mod hook;
pub mod instance;
pub mod operator;

/// Prelude for common imports
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::dag::{Dag, DagBag, DagBuilder, DagError, WorkflowType};
    pub use crate::event::{Event, EventBuffer};
    pub use crate::hook::{Hook, TriggerType};
    pub use crate::instance::{
        derive_status, Instance, InstanceStatus, TaskState, TaskStatus,
    };
    pub use crate::operator::{
        waiting_for, Operator, SyncOperator, SyncShim, TaskContext, TaskResult,
    };
}

// Re-export key types at crate root
pub use context::Context;
pub use dag::{Dag, DagBag, DagBuilder, DagError, WorkflowType};
pub use event::{Event, EventBuffer};
pub use hook::{Hook, TriggerType};
pub use instance::{derive_status, Instance, InstanceStatus, TaskState, TaskStatus};
pub use operator::{waiting_for, Operator, SyncOperator, SyncShim, TaskContext, TaskResult};
