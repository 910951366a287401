//! Persistence adapter
//!
//! All state transitions funnel through [`InstanceStore::save_instance`].
//! The engine assumes the adapter serializes writes per instance id;
//! writes for different instances are independent. For any successfully
//! delivered input or terminated task, the post-transition state is
//! durable before the intake/transition call returns.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryInstanceStore;
pub use postgres::PostgresInstanceStore;
pub use store::{DagRegistration, InstanceFilter, InstanceStore, Pagination, StoreError};
