//! Task execution context
//!
//! The handle an operator receives during `execute`: read access to the
//! instance context, the reserved input/state slots for the task, a log
//! sink, and an event buffer. Writes to the instance context flow only
//! through the returned [`TaskResult`](super::TaskResult) so the executor
//! can apply them atomically per transition.

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::context::{input_key, state_key, Context};
use crate::event::EventBuffer;

/// Per-execution handle passed to [`Operator::execute`](super::Operator::execute)
pub struct TaskContext<'a> {
    task_id: &'a str,
    attempt: u32,
    context: &'a Context,
    events: &'a mut EventBuffer,
    assigned_to: Option<String>,
}

impl<'a> TaskContext<'a> {
    /// Create a context for one execution attempt
    pub fn new(
        task_id: &'a str,
        attempt: u32,
        context: &'a Context,
        events: &'a mut EventBuffer,
    ) -> Self {
        Self {
            task_id,
            attempt,
            context,
            events,
            assigned_to: None,
        }
    }

    /// The executing task's id
    pub fn task_id(&self) -> &str {
        self.task_id
    }

    /// Current attempt number (1-based)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The instance context
    pub fn context(&self) -> &Context {
        self.context
    }

    /// Read a top-level context key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Read a context value through a dot-path
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        self.context.get_path(path)
    }

    /// External input delivered for this task (`"{task_id}_input"`), if any
    pub fn input(&self) -> Option<&Value> {
        self.context.get(&input_key(self.task_id))
    }

    /// The operator's persisted state slot (`"{task_id}_state"`), if any.
    ///
    /// Operators persist per-attempt state by returning it in a `Waiting`
    /// result's data under [`crate::context::state_key`]; this reads it
    /// back on the next attempt.
    pub fn state(&self) -> Option<&Value> {
        self.context.get(&state_key(self.task_id))
    }

    /// Key under which this operator's state slot lives
    pub fn state_key(&self) -> String {
        state_key(self.task_id)
    }

    /// Emit an event; the executor dispatches it after the task transition
    /// is persisted
    pub fn emit_event(&mut self, event_type: impl Into<String>, payload: Map<String, Value>) {
        self.events.push(event_type, payload);
    }

    /// Assign this task to a user or team (human-input and approval tasks)
    pub fn assign_to(&mut self, assignee: impl Into<String>) {
        self.assigned_to = Some(assignee.into());
    }

    /// Assignment recorded during this execution, consumed by the executor
    pub fn assigned_to(&self) -> Option<&str> {
        self.assigned_to.as_deref()
    }

    /// Log an informational record on the per-task channel
    pub fn log_info(&self, message: &str, details: Option<&Value>) {
        match details {
            Some(details) => info!(task_id = self.task_id, %details, "{message}"),
            None => info!(task_id = self.task_id, "{message}"),
        }
    }

    /// Log a warning on the per-task channel
    pub fn log_warning(&self, message: &str, details: Option<&Value>) {
        match details {
            Some(details) => warn!(task_id = self.task_id, %details, "{message}"),
            None => warn!(task_id = self.task_id, "{message}"),
        }
    }

    /// Log an error on the per-task channel
    pub fn log_error(&self, message: &str, details: Option<&Value>) {
        match details {
            Some(details) => error!(task_id = self.task_id, %details, "{message}"),
            None => error!(task_id = self.task_id, "{message}"),
        }
    }
}
