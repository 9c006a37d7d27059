//! Task groups: named sub-graphs of tasks.
//!
//! A group behaves as a single node in its pipeline graph. Its synthetic entry
//! fires when every predecessor group succeeded and releases the group's
//! [`entry_tasks`](TaskGroup::entry_tasks); its synthetic exit is reached only
//! when every [`exit_task`](TaskGroup::exit_tasks) succeeded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::dag::{DagError, DependencyGraph};
use super::graph::GraphError;
use super::retry::RetryPolicy;
use super::task::Task;
use super::types::{GroupId, TaskId};

/// A task placed in a group, with its effective retry policy and timeout.
#[derive(Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub task: Arc<dyn Task>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

impl TaskNode {
    /// Wrap a task, taking its id, retry policy and timeout from the task.
    pub fn new<T: Task + 'static>(task: T) -> Self {
        Self::from_arc(Arc::new(task))
    }

    pub fn from_arc(task: Arc<dyn Task>) -> Self {
        Self {
            id: TaskId::new(task.name()),
            retry: task.retry_policy(),
            timeout: task.timeout(),
            task,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A validated, acyclic group of tasks.
#[derive(Clone)]
pub struct TaskGroup {
    id: GroupId,
    nodes: HashMap<TaskId, TaskNode>,
    edges: DependencyGraph<TaskId>,
    order: Vec<TaskId>,
}

impl TaskGroup {
    pub fn builder(id: impl Into<GroupId>) -> TaskGroupBuilder {
        TaskGroupBuilder::new(id)
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Task ids in topological order.
    pub fn topological_order(&self) -> &[TaskId] {
        &self.order
    }

    /// Task nodes in topological order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn dependencies(&self, id: &TaskId) -> &[TaskId] {
        self.edges.dependencies(id)
    }

    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.edges.dependents(id)
    }

    pub fn ancestors(&self, id: &TaskId) -> HashSet<TaskId> {
        self.edges.ancestors(id)
    }

    pub fn descendants(&self, id: &TaskId) -> HashSet<TaskId> {
        self.edges.descendants(id)
    }

    /// Tasks released by the synthetic entry.
    pub fn entry_tasks(&self) -> Vec<TaskId> {
        self.edges.roots()
    }

    /// Tasks the synthetic exit waits on.
    pub fn exit_tasks(&self) -> Vec<TaskId> {
        self.edges.terminals()
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.id)
            .field("tasks", &self.order)
            .finish()
    }
}

/// Builder for [`TaskGroup`].
///
/// Construction errors are held until [`build`](Self::build) so the builder
/// can stay fluent.
pub struct TaskGroupBuilder {
    id: GroupId,
    nodes: HashMap<TaskId, TaskNode>,
    edges: DependencyGraph<TaskId>,
    last: Option<TaskId>,
    error: Option<DagError>,
}

impl TaskGroupBuilder {
    pub fn new(id: impl Into<GroupId>) -> Self {
        Self {
            id: id.into(),
            nodes: HashMap::new(),
            edges: DependencyGraph::new(),
            last: None,
            error: None,
        }
    }

    fn record(&mut self, result: Result<(), DagError>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    fn insert(&mut self, node: TaskNode) -> TaskId {
        let id = node.id.clone();
        let result = self.edges.add_node(id.clone());
        if result.is_ok() {
            self.nodes.insert(id.clone(), node);
        }
        self.record(result);
        self.last = Some(id.clone());
        id
    }

    /// Add a task with no predecessors inside the group.
    pub fn task(mut self, node: TaskNode) -> Self {
        self.insert(node);
        self
    }

    /// Add a task that runs after the named tasks of this group.
    pub fn task_after(mut self, node: TaskNode, depends_on: &[&str]) -> Self {
        let id = self.insert(node);
        for dep in depends_on {
            let result = self.edges.add_dependency(&id, &TaskId::new(*dep));
            self.record(result);
        }
        self
    }

    /// Add tasks as a linear chain, each after the previous one.
    ///
    /// The first task of the chain has no predecessors.
    pub fn chain(mut self, nodes: impl IntoIterator<Item = TaskNode>) -> Self {
        let mut previous: Option<TaskId> = None;
        for node in nodes {
            let id = self.insert(node);
            if let Some(prev) = previous {
                let result = self.edges.add_dependency(&id, &prev);
                self.record(result);
            }
            previous = Some(id);
        }
        self
    }

    /// Add a task after the most recently added one.
    pub fn then(mut self, node: TaskNode) -> Self {
        let previous = self.last.clone();
        let id = self.insert(node);
        if let Some(prev) = previous {
            let result = self.edges.add_dependency(&id, &prev);
            self.record(result);
        }
        self
    }

    /// Add an edge between two tasks already in the group.
    pub fn depends(mut self, from: &str, to: &str) -> Self {
        let result = self
            .edges
            .add_dependency(&TaskId::new(from), &TaskId::new(to));
        self.record(result);
        self
    }

    /// Validate and build the group.
    pub fn build(self) -> Result<TaskGroup, GraphError> {
        let group = self.id.clone();
        let wrap = move |source: DagError| GraphError::Group {
            group: group.clone(),
            source,
        };
        if let Some(e) = self.error {
            return Err(wrap(e));
        }
        if self.nodes.is_empty() {
            return Err(GraphError::EmptyGroup(self.id));
        }
        let order = self.edges.topological_sort().map_err(wrap)?;

        Ok(TaskGroup {
            id: self.id,
            nodes: self.nodes,
            edges: self.edges,
            order,
        })
    }
}
