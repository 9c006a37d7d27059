//! Pipeline graphs: task groups joined by precedence edges, plus run policy.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::dag::{DagError, DependencyGraph};
use super::group::TaskGroup;
use super::schedule::Schedule;
use super::types::{GraphId, GroupId, TaskId};
use crate::events::FailureObserver;

/// A graph never has more than one run in flight.
pub const MAX_CONCURRENT_RUNS: usize = 1;

/// Default size of a graph's task-concurrency pool.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;

/// Errors raised while constructing groups and graphs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("invalid task edges in group '{group}': {source}")]
    Group {
        group: GroupId,
        #[source]
        source: DagError,
    },

    #[error("invalid group edges: {0}")]
    Groups(#[from] DagError),

    #[error("group '{0}' has no tasks")]
    EmptyGroup(GroupId),

    #[error("graph '{0}' has no groups")]
    EmptyGraph(GraphId),

    #[error("max_concurrent_tasks must be at least 1")]
    InvalidConcurrency,
}

/// A validated pipeline graph.
#[derive(Clone)]
pub struct PipelineGraph {
    id: GraphId,
    name: String,
    groups: HashMap<GroupId, TaskGroup>,
    edges: DependencyGraph<GroupId>,
    order: Vec<GroupId>,
    schedule: Option<Schedule>,
    max_concurrent_tasks: usize,
    failure_observer: Option<Arc<dyn FailureObserver>>,
    environment: Arc<HashMap<String, Value>>,
}

impl PipelineGraph {
    pub fn builder(id: impl Into<GraphId>, name: impl Into<String>) -> PipelineGraphBuilder {
        PipelineGraphBuilder::new(id, name)
    }

    pub fn id(&self) -> &GraphId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self, id: &GroupId) -> Option<&TaskGroup> {
        self.groups.get(id)
    }

    /// Groups in topological order.
    pub fn groups(&self) -> impl Iterator<Item = &TaskGroup> {
        self.order.iter().filter_map(|id| self.groups.get(id))
    }

    pub fn topological_order(&self) -> &[GroupId] {
        &self.order
    }

    pub fn group_dependencies(&self, id: &GroupId) -> &[GroupId] {
        self.edges.dependencies(id)
    }

    pub fn group_dependents(&self, id: &GroupId) -> Vec<GroupId> {
        self.edges.dependents(id)
    }

    /// Groups that can never dispatch once `id` fails.
    pub fn group_descendants(&self, id: &GroupId) -> std::collections::HashSet<GroupId> {
        self.edges.descendants(id)
    }

    pub fn task_count(&self) -> usize {
        self.groups.values().map(|g| g.len()).sum()
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn max_concurrent_runs(&self) -> usize {
        MAX_CONCURRENT_RUNS
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.max_concurrent_tasks
    }

    pub fn failure_observer(&self) -> Option<&Arc<dyn FailureObserver>> {
        self.failure_observer.as_ref()
    }

    pub fn environment(&self) -> &Arc<HashMap<String, Value>> {
        &self.environment
    }

    /// Output key prefixes a task is allowed to read: every task of every
    /// ancestor group, and the task's own ancestors inside its group.
    pub fn upstream_prefixes(&self, group: &GroupId, task: &TaskId) -> Vec<String> {
        let mut prefixes: Vec<String> = self
            .edges
            .ancestors(group)
            .into_iter()
            .map(|g| format!("{}.", g))
            .collect();
        if let Some(g) = self.groups.get(group) {
            prefixes.extend(
                g.ancestors(task)
                    .into_iter()
                    .map(|t| format!("{}.{}.", group, t)),
            );
        }
        prefixes.sort();
        prefixes
    }
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("id", &self.id)
            .field("groups", &self.order)
            .field("schedule", &self.schedule)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .finish()
    }
}

/// Builder for [`PipelineGraph`]; acyclicity is checked in [`build`](Self::build).
pub struct PipelineGraphBuilder {
    id: GraphId,
    name: String,
    groups: HashMap<GroupId, TaskGroup>,
    edges: DependencyGraph<GroupId>,
    schedule: Option<Schedule>,
    max_concurrent_tasks: usize,
    failure_observer: Option<Arc<dyn FailureObserver>>,
    environment: HashMap<String, Value>,
    error: Option<DagError>,
}

impl PipelineGraphBuilder {
    pub fn new(id: impl Into<GraphId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            groups: HashMap::new(),
            edges: DependencyGraph::new(),
            schedule: None,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            failure_observer: None,
            environment: HashMap::new(),
            error: None,
        }
    }

    fn record(&mut self, result: Result<(), DagError>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    fn insert(&mut self, group: TaskGroup) -> GroupId {
        let id = group.id().clone();
        let result = self.edges.add_node(id.clone());
        if result.is_ok() {
            self.groups.insert(id.clone(), group);
        }
        self.record(result);
        id
    }

    /// Add a group with no predecessor groups.
    pub fn group(mut self, group: TaskGroup) -> Self {
        self.insert(group);
        self
    }

    /// Add a group that dispatches only after the named groups succeeded.
    pub fn group_after(mut self, group: TaskGroup, depends_on: &[&str]) -> Self {
        let id = self.insert(group);
        for dep in depends_on {
            let result = self.edges.add_dependency(&id, &GroupId::new(*dep));
            self.record(result);
        }
        self
    }

    /// Add an edge between two groups already in the graph.
    pub fn depends(mut self, from: &str, to: &str) -> Self {
        let result = self
            .edges
            .add_dependency(&GroupId::new(from), &GroupId::new(to));
        self.record(result);
        self
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }

    pub fn failure_observer(mut self, observer: Arc<dyn FailureObserver>) -> Self {
        self.failure_observer = Some(observer);
        self
    }

    pub fn environment(mut self, environment: HashMap<String, Value>) -> Self {
        self.environment = environment;
        self
    }

    /// Validate and build the graph.
    pub fn build(self) -> Result<PipelineGraph, GraphError> {
        if let Some(e) = self.error {
            return Err(GraphError::Groups(e));
        }
        if self.groups.is_empty() {
            return Err(GraphError::EmptyGraph(self.id));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(GraphError::InvalidConcurrency);
        }
        let order = self.edges.topological_sort()?;

        Ok(PipelineGraph {
            id: self.id,
            name: self.name,
            groups: self.groups,
            edges: self.edges,
            order,
            schedule: self.schedule,
            max_concurrent_tasks: self.max_concurrent_tasks,
            failure_observer: self.failure_observer,
            environment: Arc::new(self.environment),
        })
    }
}
