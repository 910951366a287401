//! Engine error types

use uuid::Uuid;

use civiflow_core::dag::DagError;
use civiflow_core::instance::TaskStatus;

use crate::persistence::StoreError;

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Requested DAG is not in the bag
    #[error("dag not found: {0}")]
    DagNotFound(String),

    /// DAG assembly or registration failed
    #[error("dag error: {0}")]
    Dag(#[from] DagError),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Instance does not exist
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Ready queue exceeded its soft cap; instance creation rejected
    #[error("engine busy: ready queue holds {queued} instances")]
    Busy { queued: usize },

    /// Engine is already running
    #[error("engine is already running")]
    AlreadyRunning,

    /// Invalid hook rule
    #[error("invalid hook pattern: {0}")]
    InvalidHookPattern(#[from] regex::Error),
}

/// Errors from the input intake surface
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    /// Instance does not exist
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Task id is not part of the instance's DAG
    #[error("unknown task '{task_id}' in instance {instance_id}")]
    UnknownTask { instance_id: Uuid, task_id: String },

    /// Delivery rejected: the task is not waiting for input
    #[error("task '{task_id}' is not waiting (status: {status})")]
    TaskNotWaiting { task_id: String, status: TaskStatus },

    /// Persistence failure; the delivery was not applied
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intake_error_display() {
        let error = IntakeError::TaskNotWaiting {
            task_id: "approve".to_string(),
            status: TaskStatus::Completed,
        };
        assert_eq!(
            error.to_string(),
            "task 'approve' is not waiting (status: completed)"
        );
    }

    #[test]
    fn test_busy_display() {
        let error = EngineError::Busy { queued: 2048 };
        assert!(error.to_string().contains("2048"));
    }
}
