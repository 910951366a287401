//! Process-wide DAG registry

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{Dag, DagError};

/// The process-wide registry of workflow definitions
///
/// DAGs are registered once, at startup or by a plugin-reload mechanism,
/// and are immutable thereafter. Re-registering an existing `dag_id` is a
/// configuration error.
#[derive(Default)]
pub struct DagBag {
    dags: RwLock<HashMap<String, Arc<Dag>>>,
}

impl DagBag {
    /// Create an empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a DAG
    ///
    /// # Errors
    ///
    /// Returns [`DagError::AlreadyRegistered`] when the id is taken.
    pub fn register(&self, dag: Dag) -> Result<Arc<Dag>, DagError> {
        let mut dags = self.dags.write().expect("dag bag lock poisoned");
        if dags.contains_key(dag.dag_id()) {
            return Err(DagError::AlreadyRegistered(dag.dag_id().to_string()));
        }
        let dag = Arc::new(dag);
        dags.insert(dag.dag_id().to_string(), dag.clone());
        Ok(dag)
    }

    /// Look up a DAG by id
    pub fn get(&self, dag_id: &str) -> Option<Arc<Dag>> {
        self.dags
            .read()
            .expect("dag bag lock poisoned")
            .get(dag_id)
            .cloned()
    }

    /// All registered dag ids, sorted
    pub fn dag_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .dags
            .read()
            .expect("dag bag lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered DAGs
    pub fn len(&self) -> usize {
        self.dags.read().expect("dag bag lock poisoned").len()
    }

    /// Whether the bag is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DagBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagBag").field("dags", &self.dag_ids()).finish()
    }
}
