//! Task execution results
//!
//! `TaskResult` is the only way an operator communicates an outcome to the
//! executor. Operators never raise out of `execute`; exceptional paths are
//! expressed as `Retry` or `Failed` variants.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kinds of external input a suspended task may wait for
pub mod waiting_for {
    pub const USER_INPUT: &str = "user_input";
    pub const APPROVAL: &str = "approval";
    pub const SIGNATURE: &str = "signature";
    pub const SELFIE: &str = "selfie";
    pub const ID_CAPTURE: &str = "id_capture";
    pub const CATALOG_SELECTION: &str = "catalog_selection";
    pub const MISSING_ENTITIES: &str = "missing_entities";
    pub const ENTITY_SELECTION: &str = "entity_selection";

    /// A poll on an external DAG run driven by the named operator
    pub fn external_poll(operator_type: &str) -> String {
        format!("external_poll:{operator_type}")
    }
}

/// Outcome of one operator execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
    /// Task completed; `data` is merged into the instance context
    Continue { data: Map<String, Value> },

    /// Task must be suspended awaiting external input or a timed re-poll.
    ///
    /// `data` is merged into the context *before* the task is parked, so
    /// polling operators persist their per-attempt state here. A present
    /// `retry_delay` asks the executor to wake the task again after that
    /// minimum delay even without external input.
    Waiting {
        data: Map<String, Value>,
        waiting_for: String,
        #[serde(with = "option_duration_secs", default)]
        retry_delay: Option<Duration>,
    },

    /// Transient failure; the executor re-schedules after `delay` (or the
    /// engine retry policy's backoff when absent)
    Retry {
        error: String,
        #[serde(with = "option_duration_secs", default)]
        delay: Option<Duration>,
    },

    /// Task is skipped; pure-skip downstream paths are skipped with it
    Skip { reason: String },

    /// Terminal failure; the whole instance fails
    Failed { error: String },
}

impl TaskResult {
    /// Successful completion with output data
    pub fn done(data: Map<String, Value>) -> Self {
        Self::Continue { data }
    }

    /// Successful completion with no output
    pub fn done_empty() -> Self {
        Self::Continue { data: Map::new() }
    }

    /// Suspend awaiting the named kind of input
    pub fn waiting(data: Map<String, Value>, waiting_for: impl Into<String>) -> Self {
        Self::Waiting {
            data,
            waiting_for: waiting_for.into(),
            retry_delay: None,
        }
    }

    /// Suspend with a timed wake after `delay` (the remote-poll pattern)
    pub fn waiting_with_delay(
        data: Map<String, Value>,
        waiting_for: impl Into<String>,
        delay: Duration,
    ) -> Self {
        Self::Waiting {
            data,
            waiting_for: waiting_for.into(),
            retry_delay: Some(delay),
        }
    }

    /// Transient failure, rescheduled with the engine's backoff policy
    pub fn retry(error: impl Into<String>) -> Self {
        Self::Retry {
            error: error.into(),
            delay: None,
        }
    }

    /// Transient failure, rescheduled after an explicit delay
    pub fn retry_after(error: impl Into<String>, delay: Duration) -> Self {
        Self::Retry {
            error: error.into(),
            delay: Some(delay),
        }
    }

    /// Skip this task
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            reason: reason.into(),
        }
    }

    /// Terminal failure
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    /// Whether this result suspends the task
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting { .. })
    }

    /// Whether this result is terminal for the task
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Continue { .. } | Self::Skip { .. } | Self::Failed { .. })
    }
}

/// Serde support for Option<Duration> as whole seconds
mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constructors() {
        let result = TaskResult::done(json!({"x": 1}).as_object().cloned().unwrap());
        assert!(result.is_terminal());
        assert!(!result.is_waiting());

        let result = TaskResult::waiting(Map::new(), waiting_for::USER_INPUT);
        assert!(result.is_waiting());
        assert!(!result.is_terminal());

        let result = TaskResult::retry("connection reset");
        assert!(!result.is_terminal());
    }

    #[test]
    fn test_external_poll_kind() {
        assert_eq!(waiting_for::external_poll("remote_dag"), "external_poll:remote_dag");
    }

    #[test]
    fn test_serialization_round_trip() {
        let result = TaskResult::waiting_with_delay(
            json!({"poll_state": {"run_id": "r-1"}}).as_object().cloned().unwrap(),
            waiting_for::external_poll("remote_dag"),
            Duration::from_secs(5),
        );

        let encoded = serde_json::to_string(&result).unwrap();
        assert!(encoded.contains("\"status\":\"waiting\""));

        let decoded: TaskResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn test_retry_delay_default_on_missing_field() {
        let decoded: TaskResult =
            serde_json::from_str(r#"{"status":"retry","error":"boom"}"#).unwrap();
        assert_eq!(decoded, TaskResult::retry("boom"));
    }
}
