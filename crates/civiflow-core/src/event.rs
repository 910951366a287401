//! Event protocol
//!
//! Events are transient dispatch units: they are never persisted as a
//! durable log, only their effects are (the child instances hooks create
//! from them). Types use dot notation, e.g. `ENTITY_CREATED.property_record`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ============================================================================
// Event Type Constants
// ============================================================================

// Engine lifecycle events
pub const WORKFLOW_COMPLETED: &str = "WORKFLOW_COMPLETED";
pub const WORKFLOW_FAILED: &str = "WORKFLOW_FAILED";

// Approval events
pub const APPROVAL_REQUESTED: &str = "APPROVAL_REQUESTED";
pub const APPROVAL_DECIDED: &str = "APPROVAL_DECIDED";

// Entity events carry the entity type as a dotted suffix
pub const ENTITY_CREATED_PREFIX: &str = "ENTITY_CREATED";
pub const ENTITY_UPDATED_PREFIX: &str = "ENTITY_UPDATED";

/// Event type for a created entity of the given type
pub fn entity_created(entity_type: &str) -> String {
    format!("{ENTITY_CREATED_PREFIX}.{entity_type}")
}

/// Event type for an updated entity of the given type
pub fn entity_updated(entity_type: &str) -> String {
    format!("{ENTITY_UPDATED_PREFIX}.{entity_type}")
}

// ============================================================================
// Event
// ============================================================================

/// An event emitted by the engine or by an operator.
///
/// `source_workflow_id` is the DAG id of the emitting instance and
/// `source_instance_id` the instance itself; hooks match on the type and
/// filter on the source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Dotted event type (e.g. `ENTITY_CREATED.property_record`)
    pub event_type: String,

    /// DAG id of the emitting instance
    pub source_workflow_id: String,

    /// Instance that emitted the event
    pub source_instance_id: Uuid,

    /// Event payload
    pub payload: Map<String, Value>,

    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a new event stamped with the current time
    pub fn new(
        event_type: impl Into<String>,
        source_workflow_id: impl Into<String>,
        source_instance_id: Uuid,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source_workflow_id: source_workflow_id.into(),
            source_instance_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Read a payload field through a dot-path
    pub fn payload_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.payload.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

// ============================================================================
// Event Buffer
// ============================================================================

/// An event emitted by an operator, before the engine stamps its source.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub event_type: String,
    pub payload: Map<String, Value>,
}

/// Buffer of events emitted during one task execution.
///
/// The executor drains the buffer after the task transition is persisted
/// and dispatches the stamped events through the hook registry.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Vec<PendingEvent>,
}

impl EventBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn push(&mut self, event_type: impl Into<String>, payload: Map<String, Value>) {
        self.events.push(PendingEvent {
            event_type: event_type.into(),
            payload,
        });
    }

    /// Drain all buffered events
    pub fn drain(&mut self) -> Vec<PendingEvent> {
        std::mem::take(&mut self.events)
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
