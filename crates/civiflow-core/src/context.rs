//! Per-instance execution context
//!
//! The context is the sole data plane between tasks: a flat mapping from
//! string keys to JSON values. Task outputs are shallow-merged into it,
//! consumers read nested values through dot-paths, and the intake layer
//! writes externally delivered input under one reserved key per task.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key prefix for engine-internal entries.
///
/// Keys starting with this prefix are never propagated into child
/// instances created by hooks.
pub const INTERNAL_PREFIX: &str = "_";

/// Reserved context key where the intake layer places external input
/// for a task.
pub fn input_key(task_id: &str) -> String {
    format!("{task_id}_input")
}

/// Conventional context key where an operator round-trips its per-attempt
/// state (remote run ids, poll timestamps) across suspensions.
pub fn state_key(task_id: &str) -> String {
    format!("{task_id}_state")
}

/// The per-instance key-value bag carrying data between tasks.
///
/// Values are untyped JSON; namespacing outputs by task id
/// (`"{task_id}_something"`) is an operator-author convention, not an
/// engine rule. The engine guarantees only that merges are applied
/// atomically per task transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Context {
    values: Map<String, Value>,
}

impl Context {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from an existing map
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Read a top-level key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Read a value through a dot-path (`"a.b.c"` descends nested objects)
    ///
    /// A path without dots is equivalent to [`Context::get`]. Returns
    /// `None` when any segment is missing or a non-object is traversed.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.values.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Whether a top-level key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Insert a single value, replacing any previous entry
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Remove a top-level key, returning the previous value
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Shallow-merge a task's output map into the context
    ///
    /// Later writes win per key; nested objects are replaced wholesale,
    /// not deep-merged.
    pub fn merge(&mut self, data: Map<String, Value>) {
        for (key, value) in data {
            self.values.insert(key, value);
        }
    }

    /// The view of this context that may seed a child instance created by
    /// a hook: every entry except engine-internal (`_`-prefixed) keys.
    pub fn child_seed(&self) -> Map<String, Value> {
        self.values
            .iter()
            .filter(|(k, _)| !k.starts_with(INTERNAL_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the context is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Map<String, Value>> for Context {
    fn from(values: Map<String, Value>) -> Self {
        Self::from_map(values)
    }
}
