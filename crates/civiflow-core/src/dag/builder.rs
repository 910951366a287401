//! DAG builder
//!
//! Assembles a [`Dag`] from operators and edge declarations. The builder
//! is an explicit value; operators are added to it directly rather than
//! auto-registering through any ambient scope. Edges must be declared
//! before `build()`, which validates the graph and freezes it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{Dag, DagError, WorkflowType};
use crate::operator::Operator;

/// Builder for a [`Dag`]
///
/// # Example
///
/// ```ignore
/// let dag = DagBuilder::new("property_registration")
///     .description("Registro de propiedad")
///     .workflow_type(WorkflowType::Process)
///     .task(collect)
///     .task(validate)
///     .task(approve)
///     .task(finalize)
///     .edge("collect", "validate")
///     .edge("validate", "approve")
///     .edge("approve", "finalize")
///     .build()?;
/// ```
pub struct DagBuilder {
    dag_id: String,
    description: String,
    tags: Vec<String>,
    workflow_type: WorkflowType,
    tasks: Vec<Arc<dyn Operator>>,
    edges: Vec<(String, String)>,
    emits_events: bool,
    listens_to_events: bool,
    entity_outputs: Vec<String>,
}

impl DagBuilder {
    /// Start a builder for the given dag id
    pub fn new(dag_id: impl Into<String>) -> Self {
        Self {
            dag_id: dag_id.into(),
            description: String::new(),
            tags: vec![],
            workflow_type: WorkflowType::default(),
            tasks: vec![],
            edges: vec![],
            emits_events: false,
            listens_to_events: false,
            entity_outputs: vec![],
        }
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a classification tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set the workflow category
    pub fn workflow_type(mut self, workflow_type: WorkflowType) -> Self {
        self.workflow_type = workflow_type;
        self
    }

    /// Mark this DAG as an event emitter
    pub fn emits_events(mut self, emits: bool) -> Self {
        self.emits_events = emits;
        self
    }

    /// Mark this DAG as a hook listener
    pub fn listens_to_events(mut self, listens: bool) -> Self {
        self.listens_to_events = listens;
        self
    }

    /// Declare an entity label instances may produce
    pub fn entity_output(mut self, label: impl Into<String>) -> Self {
        self.entity_outputs.push(label.into());
        self
    }

    /// Add an operator
    pub fn task(mut self, operator: impl Operator) -> Self {
        self.tasks.push(Arc::new(operator));
        self
    }

    /// Add an already-shared operator
    pub fn task_arc(mut self, operator: Arc<dyn Operator>) -> Self {
        self.tasks.push(operator);
        self
    }

    /// Declare a single edge `from -> to`
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Declare one-to-many edges `from -> each of to`
    pub fn fan_out<I, S>(mut self, from: impl Into<String>, to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let from = from.into();
        for target in to {
            self.edges.push((from.clone(), target.into()));
        }
        self
    }

    /// Declare many-to-one edges `each of from -> to`
    pub fn fan_in<I, S>(mut self, from: I, to: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let to = to.into();
        for source in from {
            self.edges.push((source.into(), to.clone()));
        }
        self
    }

    /// Declare a linear chain `a -> b -> c -> ...`
    pub fn chain<I, S>(mut self, task_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = task_ids.into_iter().map(Into::into).collect();
        for pair in ids.windows(2) {
            self.edges.push((pair[0].clone(), pair[1].clone()));
        }
        self
    }

    /// Validate and freeze the DAG
    ///
    /// # Errors
    ///
    /// Fails on duplicate task ids, edges naming unknown tasks, or cycles.
    pub fn build(self) -> Result<Dag, DagError> {
        let mut tasks: HashMap<String, Arc<dyn Operator>> = HashMap::new();
        for operator in self.tasks {
            let task_id = operator.task_id().to_string();
            if tasks.insert(task_id.clone(), operator).is_some() {
                return Err(DagError::DuplicateTask {
                    dag_id: self.dag_id,
                    task_id,
                });
            }
        }

        let mut upstream: HashMap<String, Vec<String>> = HashMap::new();
        let mut downstream: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in &self.edges {
            for endpoint in [from, to] {
                if !tasks.contains_key(endpoint) {
                    return Err(DagError::UnknownTask {
                        dag_id: self.dag_id,
                        task_id: endpoint.clone(),
                    });
                }
            }
            downstream.entry(from.clone()).or_default().push(to.clone());
            upstream.entry(to.clone()).or_default().push(from.clone());
        }

        let topo_order = topo_sort(&self.dag_id, &tasks, &upstream, &downstream)?;

        Ok(Dag {
            dag_id: self.dag_id,
            description: self.description,
            tags: self.tags,
            workflow_type: self.workflow_type,
            tasks,
            edges: self.edges,
            upstream,
            downstream,
            topo_order,
            emits_events: self.emits_events,
            listens_to_events: self.listens_to_events,
            entity_outputs: self.entity_outputs,
        })
    }
}

/// Kahn's algorithm; deterministic order via sorted zero-degree frontier
fn topo_sort(
    dag_id: &str,
    tasks: &HashMap<String, Arc<dyn Operator>>,
    upstream: &HashMap<String, Vec<String>>,
    downstream: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, DagError> {
    let mut in_degree: HashMap<&str, usize> = tasks
        .keys()
        .map(|id| (id.as_str(), upstream.get(id).map(Vec::len).unwrap_or(0)))
        .collect();

    let mut frontier: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    frontier.sort_unstable();
    let mut queue: VecDeque<&str> = frontier.into();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(task_id) = queue.pop_front() {
        order.push(task_id.to_string());

        let mut unlocked = vec![];
        for next in downstream.get(task_id).map(Vec::as_slice).unwrap_or(&[]) {
            let degree = in_degree
                .get_mut(next.as_str())
                .expect("edge endpoints validated above");
            *degree -= 1;
            if *degree == 0 {
                unlocked.push(next.as_str());
            }
        }
        unlocked.sort_unstable();
        queue.extend(unlocked);
    }

    if order.len() != tasks.len() {
        let mut remaining: Vec<String> = tasks
            .keys()
            .filter(|id| !order.contains(*id))
            .cloned()
            .collect();
        remaining.sort_unstable();
        return Err(DagError::Cycle {
            dag_id: dag_id.to_string(),
            remaining,
        });
    }

    Ok(order)
}
