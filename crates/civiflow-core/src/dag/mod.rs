//! Workflow definitions
//!
//! A `Dag` is an immutable directed acyclic graph of operators, assembled
//! through [`DagBuilder`] and indexed process-wide in a [`DagBag`]. The
//! builder validates acyclicity at `build()`; a registered DAG never
//! changes.

mod bag;
mod builder;

pub use bag::DagBag;
pub use builder::DagBuilder;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::operator::Operator;

/// Errors from DAG assembly and registration
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// Two operators declared the same task id
    #[error("duplicate task id in dag '{dag_id}': {task_id}")]
    DuplicateTask { dag_id: String, task_id: String },

    /// An edge references a task id that was never added
    #[error("edge references unknown task in dag '{dag_id}': {task_id}")]
    UnknownTask { dag_id: String, task_id: String },

    /// The declared edges contain a cycle
    #[error("dag '{dag_id}' contains a cycle through: {remaining:?}")]
    Cycle { dag_id: String, remaining: Vec<String> },

    /// A DAG with this id is already registered
    #[error("dag already registered: {0}")]
    AlreadyRegistered(String),
}

/// Broad category of a workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Process,
    DocumentProcessing,
    Admin,
}

impl Default for WorkflowType {
    fn default() -> Self {
        Self::Process
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Process => "process",
            Self::DocumentProcessing => "document_processing",
            Self::Admin => "admin",
        };
        write!(f, "{s}")
    }
}

/// An immutable workflow definition
///
/// Operators are held behind `Arc` so that many concurrent instances share
/// the same (stateless) operator values.
pub struct Dag {
    pub(crate) dag_id: String,
    pub(crate) description: String,
    pub(crate) tags: Vec<String>,
    pub(crate) workflow_type: WorkflowType,
    pub(crate) tasks: HashMap<String, Arc<dyn Operator>>,
    pub(crate) edges: Vec<(String, String)>,
    pub(crate) upstream: HashMap<String, Vec<String>>,
    pub(crate) downstream: HashMap<String, Vec<String>>,
    pub(crate) topo_order: Vec<String>,
    pub(crate) emits_events: bool,
    pub(crate) listens_to_events: bool,
    pub(crate) entity_outputs: Vec<String>,
}

impl Dag {
    /// Unique id of this definition
    pub fn dag_id(&self) -> &str {
        &self.dag_id
    }

    /// Human-readable description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Classification tags
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Workflow category
    pub fn workflow_type(&self) -> WorkflowType {
        self.workflow_type
    }

    /// Whether instances of this DAG emit events for hooks
    pub fn emits_events(&self) -> bool {
        self.emits_events
    }

    /// Whether this DAG is intended as a hook listener
    pub fn listens_to_events(&self) -> bool {
        self.listens_to_events
    }

    /// Labels of entities an instance of this DAG may produce
    pub fn entity_outputs(&self) -> &[String] {
        &self.entity_outputs
    }

    /// Look up an operator by task id
    pub fn task(&self, task_id: &str) -> Option<&Arc<dyn Operator>> {
        self.tasks.get(task_id)
    }

    /// Whether the DAG contains the given task
    pub fn contains_task(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// All task ids in topological order
    pub fn topo_order(&self) -> &[String] {
        &self.topo_order
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the DAG has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Declared edges
    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    /// Direct upstream dependencies of a task
    pub fn upstream_of(&self, task_id: &str) -> &[String] {
        self.upstream.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct downstream dependents of a task
    pub fn downstream_of(&self, task_id: &str) -> &[String] {
        self.downstream
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Tasks with no upstream dependencies
    pub fn source_tasks(&self) -> Vec<&str> {
        self.topo_order
            .iter()
            .filter(|id| self.upstream_of(id).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Tasks with no downstream dependents (the terminal leaves)
    pub fn sink_tasks(&self) -> Vec<&str> {
        self.topo_order
            .iter()
            .filter(|id| self.downstream_of(id).is_empty())
            .map(String::as_str)
            .collect()
    }
}

impl std::fmt::Debug for Dag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dag")
            .field("dag_id", &self.dag_id)
            .field("workflow_type", &self.workflow_type)
            .field("tasks", &self.topo_order)
            .field("edges", &self.edges)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MarkerOperator;
    use super::*;

    fn diamond() -> Dag {
        DagBuilder::new("diamond")
            .task(MarkerOperator::new("a"))
            .task(MarkerOperator::new("b"))
            .task(MarkerOperator::new("c"))
            .task(MarkerOperator::new("d"))
            .fan_out("a", ["b", "c"])
            .fan_in(["b", "c"], "d")
            .build()
            .expect("diamond should build")
    }

    #[test]
    fn test_topology_queries() {
        let dag = diamond();

        assert_eq!(dag.len(), 4);
        assert_eq!(dag.source_tasks(), vec!["a"]);
        assert_eq!(dag.sink_tasks(), vec!["d"]);
        assert_eq!(dag.upstream_of("d"), ["b", "c"]);
        assert_eq!(dag.downstream_of("a"), ["b", "c"]);
        assert!(dag.upstream_of("a").is_empty());
    }

    #[test]
    fn test_topo_order_respects_edges() {
        let dag = diamond();
        let order = dag.topo_order();
        let position = |id: &str| order.iter().position(|t| t == id).unwrap();

        assert!(position("a") < position("b"));
        assert!(position("a") < position("c"));
        assert!(position("b") < position("d"));
        assert!(position("c") < position("d"));
    }

    #[test]
    fn test_cycle_rejected() {
        let result = DagBuilder::new("cyclic")
            .task(MarkerOperator::new("a"))
            .task(MarkerOperator::new("b"))
            .edge("a", "b")
            .edge("b", "a")
            .build();

        assert!(matches!(result, Err(DagError::Cycle { .. })));
    }

    #[test]
    fn test_unknown_edge_endpoint_rejected() {
        let result = DagBuilder::new("dangling")
            .task(MarkerOperator::new("a"))
            .edge("a", "ghost")
            .build();

        assert!(matches!(
            result,
            Err(DagError::UnknownTask { ref task_id, .. }) if task_id == "ghost"
        ));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let result = DagBuilder::new("dup")
            .task(MarkerOperator::new("a"))
            .task(MarkerOperator::new("a"))
            .build();

        assert!(matches!(result, Err(DagError::DuplicateTask { .. })));
    }
}
