//! Hook registry
//!
//! Matches emitted events against registered [`Hook`] rules and reports
//! which listeners should fire, in priority order. Listener instance
//! creation belongs to the engine, which also enforces the hook-chain
//! depth bound.

use std::sync::RwLock;

use tracing::debug;

use civiflow_core::event::Event;
use civiflow_core::hook::Hook;

/// Registry of hook rules
///
/// Rules are registered at startup and are immutable thereafter (subject
/// to a plugin-reload mechanism re-creating the registry).
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Hook>>,
}

impl HookRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook rule
    pub fn register(&self, hook: Hook) {
        debug!(hook_id = %hook.hook_id, listener = %hook.listener_workflow_id, "registered hook");
        self.hooks.write().expect("hook registry lock poisoned").push(hook);
    }

    /// Hooks matching the event, sorted by priority descending
    pub fn matching(&self, event: &Event) -> Vec<Hook> {
        let hooks = self.hooks.read().expect("hook registry lock poisoned");
        let mut matched: Vec<Hook> = hooks.iter().filter(|h| h.matches(event)).cloned().collect();
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));
        matched
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.hooks.read().expect("hook registry lock poisoned").len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self
            .hooks
            .read()
            .expect("hook registry lock poisoned")
            .iter()
            .map(|h| h.hook_id.clone())
            .collect();
        f.debug_struct("HookRegistry").field("hooks", &ids).finish()
    }
}
