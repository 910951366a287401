//! # Civiflow Engine
//!
//! A durable workflow executor for DAGs of self-contained operators.
//!
//! ## Features
//!
//! - **Concurrent scheduling**: a bounded worker pool advances independent
//!   instances in parallel; tasks within one instance stay serialized
//! - **Suspension & intake**: tasks that need external input park the
//!   instance until `deliver_input`/`deliver_decision` wakes it
//! - **Retries and timeouts**: exponential backoff with jitter for
//!   transient failures; per-task timeouts measured from first suspension
//! - **Hooks**: emitted events create listener instances through the hook
//!   registry, bounded in chain depth
//! - **Pluggable persistence**: every transition funnels through the
//!   [`InstanceStore`] adapter (in-memory for tests, PostgreSQL for
//!   production)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │   (ready queue → worker pool → per-instance advancement)    │
//! └─────────────────────────────────────────────────────────────┘
//!        │                    │                      │
//!        ▼                    ▼                      ▼
//! ┌──────────────┐   ┌─────────────────┐   ┌──────────────────┐
//! │  wait table  │   │  HookRegistry   │   │  InstanceStore   │
//! │ (suspended,  │   │ (events → new   │   │ (durable per-    │
//! │  timed wake) │   │  instances)     │   │  instance state) │
//! └──────────────┘   └─────────────────┘   └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use civiflow_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryInstanceStore::new());
//! let engine = Engine::new(store);
//!
//! engine.register_dag(my_dag()?).await?;
//! engine.start()?;
//!
//! let instance_id = engine.create_instance("my_dag", "user-1", None).await?;
//! // ... the instance pauses on its first human task
//! engine.deliver_input(instance_id, "collect", payload).await?;
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod persistence;
pub mod reliability;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::error::{EngineError, IntakeError};
    pub use crate::executor::{DecisionPayload, Engine, EngineStats};
    pub use crate::hooks::HookRegistry;
    pub use crate::persistence::{
        DagRegistration, InMemoryInstanceStore, InstanceFilter, InstanceStore, Pagination,
        PostgresInstanceStore, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use civiflow_core::prelude::*;
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use error::{EngineError, IntakeError};
pub use executor::{DecisionPayload, Engine, EngineStats};
pub use hooks::HookRegistry;
pub use persistence::{
    DagRegistration, InMemoryInstanceStore, InstanceFilter, InstanceStore, Pagination,
    PostgresInstanceStore, StoreError,
};
pub use reliability::RetryPolicy;
