//! # Civiflow Operators
//!
//! Base operator library for the Civiflow workflow engine.
//!
//! Every operator here is self-contained: it knows its own task, not the
//! workflow around it. Human-facing operators (`UserInputOperator`,
//! `ApprovalOperator`) suspend their instance until the intake surface
//! delivers input; integration operators (`HttpOperator`,
//! `RemoteDagOperator`) talk to external systems with retry/poll
//! semantics; entity operators write to the external entity store and
//! emit `ENTITY_*` events for hook-linked workflows.

pub mod approval;
pub mod entity;
pub mod function;
pub mod http;
pub mod remote_dag;
pub mod user_input;

/// Prelude for common imports
pub mod prelude {
    pub use crate::approval::ApprovalOperator;
    pub use crate::entity::{
        CreateEntityOperator, EntityRecord, EntityStore, InMemoryEntityStore,
        UpdateEntityOperator,
    };
    pub use crate::function::FnOperator;
    pub use crate::http::HttpOperator;
    pub use crate::remote_dag::{
        HttpRemoteDagClient, RemoteDagClient, RemoteDagOperator, RemoteRunState,
    };
    pub use crate::user_input::{FormConfig, FormField, UserInputOperator};
}

pub use approval::ApprovalOperator;
pub use entity::{
    CreateEntityOperator, EntityRecord, EntityStore, InMemoryEntityStore, UpdateEntityOperator,
};
pub use function::FnOperator;
pub use http::HttpOperator;
pub use remote_dag::{HttpRemoteDagClient, RemoteDagClient, RemoteDagOperator, RemoteRunState};
pub use user_input::{FormConfig, FormField, UserInputOperator};
