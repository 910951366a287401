//! Hook rules
//!
//! A hook says "when event E fires, create an instance of DAG L". Rules
//! are registered at startup and immutable thereafter. Matching is
//! regex-over-event-type plus an optional source filter and equality
//! conditions over payload fields.

use regex::Regex;
use serde_json::{Map, Value};

use crate::event::Event;

/// When a matching hook fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    /// Fire as soon as the event matches
    Immediate,
    /// Fire only when the payload conditions also hold
    Conditional,
}

/// A rule linking emitted events to listener workflow instances
#[derive(Debug, Clone)]
pub struct Hook {
    /// Unique id of this rule
    pub hook_id: String,

    /// DAG to instantiate when the hook fires
    pub listener_workflow_id: String,

    /// Only match events from this DAG; `None` matches any source
    pub source_workflow_id: Option<String>,

    /// Regex matched against the full event type
    pub event_pattern: Regex,

    /// Equality constraints over payload fields (dot-paths allowed)
    pub conditions: Vec<(String, Value)>,

    pub trigger_type: TriggerType,

    /// Tiebreak among concurrently firing hooks; higher fires first
    pub priority: i32,

    /// Copy/rename map from event payload keys into the listener's
    /// initial context
    pub context_mapping: Vec<(String, String)>,
}

impl Hook {
    /// Create an immediate hook matching `event_pattern` from any source
    pub fn new(
        hook_id: impl Into<String>,
        event_pattern: &str,
        listener_workflow_id: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            hook_id: hook_id.into(),
            listener_workflow_id: listener_workflow_id.into(),
            source_workflow_id: None,
            event_pattern: Regex::new(event_pattern)?,
            conditions: vec![],
            trigger_type: TriggerType::Immediate,
            priority: 0,
            context_mapping: vec![],
        })
    }

    /// Restrict to events from one source DAG
    pub fn with_source(mut self, source_workflow_id: impl Into<String>) -> Self {
        let source = source_workflow_id.into();
        self.source_workflow_id = if source == "*" { None } else { Some(source) };
        self
    }

    /// Add a payload equality condition; marks the hook conditional
    pub fn with_condition(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push((field.into(), value));
        self.trigger_type = TriggerType::Conditional;
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Copy `payload_key` into the listener context under `context_key`
    pub fn map_context(
        mut self,
        payload_key: impl Into<String>,
        context_key: impl Into<String>,
    ) -> Self {
        self.context_mapping
            .push((payload_key.into(), context_key.into()));
        self
    }

    /// Whether this hook fires for the given event
    pub fn matches(&self, event: &Event) -> bool {
        if !self.event_pattern.is_match(&event.event_type) {
            return false;
        }
        if let Some(source) = &self.source_workflow_id {
            if source != &event.source_workflow_id {
                return false;
            }
        }
        self.conditions
            .iter()
            .all(|(field, expected)| event.payload_path(field) == Some(expected))
    }

    /// Build the listener instance's initial context from the event payload
    ///
    /// With an empty mapping the whole payload is copied. Engine-internal
    /// (`_`-prefixed) keys never propagate into the child.
    pub fn seed_context(&self, event: &Event) -> Map<String, Value> {
        let mut seed = Map::new();
        if self.context_mapping.is_empty() {
            for (key, value) in &event.payload {
                if !key.starts_with('_') {
                    seed.insert(key.clone(), value.clone());
                }
            }
            return seed;
        }

        for (payload_key, context_key) in &self.context_mapping {
            if context_key.starts_with('_') {
                continue;
            }
            if let Some(value) = event.payload_path(payload_key) {
                seed.insert(context_key.clone(), value.clone());
            }
        }
        seed
    }
}
