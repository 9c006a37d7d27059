//! Pipeline graph execution engine.
//!
//! The `GraphExecutor` drives one run of a [`PipelineGraph`]. There are no
//! waves: a task is dispatched the moment its own predecessors succeeded
//! (and, for a group's entry tasks, the moment every predecessor group
//! succeeded). A failure never cancels anything already dispatched; it only
//! marks the failed task's descendants `Skipped`, inside its group and across
//! groups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::context::ContextStore;
use crate::core::graph::PipelineGraph;
use crate::core::group::TaskGroup;
use crate::core::types::{GraphId, GroupId, GroupStatus, RunId, RunStatus, TaskRef, TaskStatus};
use crate::events::{Event, EventBus, RunFailure};

use super::cancel::CancelSignal;
use super::executor::{Invocation, TaskExecutor, TaskResult};

/// Result of one run of a graph.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub status: RunStatus,
    pub duration: Duration,
    /// Results of every dispatched task.
    pub task_results: HashMap<TaskRef, TaskResult>,
    /// Final status of every task of the graph.
    pub task_statuses: HashMap<TaskRef, TaskStatus>,
    pub group_statuses: HashMap<GroupId, GroupStatus>,
    /// Set when the run failed.
    pub failure: Option<RunFailure>,
    /// Outputs of every succeeded task.
    pub outputs: ContextStore,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn task_status(&self, group: &str, task: &str) -> Option<TaskStatus> {
        self.task_statuses.get(&TaskRef::new(group, task)).copied()
    }

    pub fn group_status(&self, group: &str) -> Option<GroupStatus> {
        self.group_statuses.get(&GroupId::new(group)).copied()
    }

    pub fn get_task_result(&self, group: &str, task: &str) -> Option<&TaskResult> {
        self.task_results.get(&TaskRef::new(group, task))
    }

    fn with_status(&self, status: TaskStatus) -> Vec<TaskRef> {
        let mut tasks: Vec<TaskRef> = self
            .task_statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(t, _)| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.to_string());
        tasks
    }

    pub fn failed_tasks(&self) -> Vec<TaskRef> {
        self.with_status(TaskStatus::Failed)
    }

    pub fn skipped_tasks(&self) -> Vec<TaskRef> {
        self.with_status(TaskStatus::Skipped)
    }

    pub fn completed_count(&self) -> usize {
        self.with_status(TaskStatus::Succeeded).len()
    }
}

/// The run status record. Shared by the coordinator and the task futures.
struct RunState {
    graph_id: GraphId,
    run_id: RunId,
    tasks: HashMap<TaskRef, TaskStatus>,
    groups: HashMap<GroupId, GroupStatus>,
    results: HashMap<TaskRef, TaskResult>,
    /// First task to fail terminally, in completion order.
    first_failure: Option<TaskRef>,
}

impl RunState {
    fn new(graph: &PipelineGraph, run_id: RunId) -> Self {
        let mut tasks = HashMap::new();
        let mut groups = HashMap::new();
        for group in graph.groups() {
            groups.insert(group.id().clone(), TaskStatus::Pending);
            for node in group.tasks() {
                tasks.insert(
                    TaskRef::new(group.id().clone(), node.id.clone()),
                    TaskStatus::Pending,
                );
            }
        }
        Self {
            graph_id: graph.id().clone(),
            run_id,
            tasks,
            groups,
            results: HashMap::new(),
            first_failure: None,
        }
    }

    fn task_status(&self, task: &TaskRef) -> TaskStatus {
        self.tasks.get(task).copied().unwrap_or(TaskStatus::Pending)
    }

    fn group_status(&self, group: &GroupId) -> GroupStatus {
        self.groups.get(group).copied().unwrap_or(TaskStatus::Pending)
    }

    /// One pass over the graph in topological order: skip what can never
    /// run, start groups whose predecessors all succeeded, and release tasks
    /// whose predecessors all succeeded. With `dispatch == false` (run
    /// cancelled) nothing new starts.
    fn advance(&mut self, graph: &PipelineGraph, dispatch: bool) -> (Vec<TaskRef>, Vec<Event>) {
        let mut ready = Vec::new();
        let mut events = Vec::new();

        for group in graph.groups() {
            let gid = group.id();

            if self.group_status(gid) == TaskStatus::Pending {
                let deps = graph.group_dependencies(gid);
                let blocked = deps
                    .iter()
                    .any(|d| matches!(self.group_status(d), TaskStatus::Failed | TaskStatus::Skipped));
                if blocked {
                    self.skip_group(group, &mut events);
                    continue;
                }
                let released = deps
                    .iter()
                    .all(|d| self.group_status(d) == TaskStatus::Succeeded);
                if !released || !dispatch {
                    continue;
                }
                self.groups.insert(gid.clone(), TaskStatus::Running);
                events.push(Event::group_started(
                    self.graph_id.clone(),
                    self.run_id,
                    gid.clone(),
                ));
                debug!(group = %gid, "group started");
            }

            if self.group_status(gid) != TaskStatus::Running {
                continue;
            }

            for node in group.tasks() {
                let task = TaskRef::new(gid.clone(), node.id.clone());
                if self.task_status(&task) != TaskStatus::Pending {
                    continue;
                }
                let deps = group.dependencies(&node.id);
                let statuses: Vec<TaskStatus> = deps
                    .iter()
                    .map(|d| self.task_status(&TaskRef::new(gid.clone(), d.clone())))
                    .collect();

                if statuses
                    .iter()
                    .any(|s| matches!(s, TaskStatus::Failed | TaskStatus::Skipped))
                {
                    debug!(task = %task, "predecessor did not succeed, skipping");
                    self.tasks.insert(task.clone(), TaskStatus::Skipped);
                    events.push(Event::task_skipped(self.graph_id.clone(), self.run_id, task));
                } else if dispatch && statuses.iter().all(|s| *s == TaskStatus::Succeeded) {
                    self.tasks.insert(task.clone(), TaskStatus::Running);
                    ready.push(task);
                }
            }

            self.close_group(group, &mut events);
        }

        (ready, events)
    }

    fn skip_group(&mut self, group: &TaskGroup, events: &mut Vec<Event>) {
        debug!(group = %group.id(), "predecessor group did not succeed, skipping");
        for node in group.tasks() {
            let task = TaskRef::new(group.id().clone(), node.id.clone());
            self.tasks.insert(task.clone(), TaskStatus::Skipped);
            events.push(Event::task_skipped(self.graph_id.clone(), self.run_id, task));
        }
        self.groups.insert(group.id().clone(), TaskStatus::Skipped);
        events.push(Event::group_finished(
            self.graph_id.clone(),
            self.run_id,
            group.id().clone(),
            TaskStatus::Skipped,
        ));
    }

    /// Mark a running group terminal once all its tasks are.
    fn close_group(&mut self, group: &TaskGroup, events: &mut Vec<Event>) {
        if self.group_status(group.id()) != TaskStatus::Running {
            return;
        }
        let statuses: Vec<TaskStatus> = group
            .tasks()
            .map(|n| self.task_status(&TaskRef::new(group.id().clone(), n.id.clone())))
            .collect();
        if !statuses.iter().all(|s| s.is_terminal()) {
            return;
        }
        let status = if statuses.iter().all(|s| *s == TaskStatus::Succeeded) {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        info!(group = %group.id(), status = %status, "group finished");
        self.groups.insert(group.id().clone(), status);
        events.push(Event::group_finished(
            self.graph_id.clone(),
            self.run_id,
            group.id().clone(),
            status,
        ));
    }

    fn record(&mut self, graph: &PipelineGraph, result: TaskResult) -> Vec<Event> {
        let task = result.task.clone();
        let status = if result.success {
            TaskStatus::Succeeded
        } else {
            if self.first_failure.is_none() {
                self.first_failure = Some(task.clone());
            }
            TaskStatus::Failed
        };
        self.tasks.insert(task.clone(), status);
        self.results.insert(task.clone(), result);

        let mut events = Vec::new();
        if let Some(group) = graph.group(&task.group) {
            self.close_group(group, &mut events);
        }
        events
    }

    /// Settle whatever cancellation left behind. Returns the run status.
    fn finish(&mut self, graph: &PipelineGraph, events: &mut Vec<Event>) -> RunStatus {
        let mut undispatched = false;
        for group in graph.groups() {
            for node in group.tasks() {
                let task = TaskRef::new(group.id().clone(), node.id.clone());
                if self.task_status(&task) == TaskStatus::Pending {
                    undispatched = true;
                    self.tasks.insert(task.clone(), TaskStatus::Skipped);
                    events.push(Event::task_skipped(self.graph_id.clone(), self.run_id, task));
                }
            }
            if !self.group_status(group.id()).is_terminal() {
                let statuses: Vec<TaskStatus> = group
                    .tasks()
                    .map(|n| self.task_status(&TaskRef::new(group.id().clone(), n.id.clone())))
                    .collect();
                let status = if statuses.contains(&TaskStatus::Failed) {
                    TaskStatus::Failed
                } else if statuses.iter().all(|s| *s == TaskStatus::Succeeded) {
                    TaskStatus::Succeeded
                } else {
                    TaskStatus::Skipped
                };
                self.groups.insert(group.id().clone(), status);
                events.push(Event::group_finished(
                    self.graph_id.clone(),
                    self.run_id,
                    group.id().clone(),
                    status,
                ));
            }
        }

        if self.first_failure.is_some() {
            RunStatus::Failed
        } else if undispatched {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        }
    }
}

/// Executor for running pipeline graphs.
pub struct GraphExecutor {
    events: Arc<EventBus>,
}

impl GraphExecutor {
    pub fn new() -> Self {
        Self::with_events(Arc::new(EventBus::new()))
    }

    pub fn with_events(events: Arc<EventBus>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run `graph` once, to completion, under a fresh run id.
    pub async fn run(&self, graph: &Arc<PipelineGraph>) -> RunResult {
        self.run_with(graph, RunId::new(), CancelSignal::new()).await
    }

    /// Run `graph` under `run_id`, observing `cancel` between dispatches.
    ///
    /// If the run ends `Failed`, the graph's failure observer (if any) is
    /// notified exactly once before this returns. The observer runs on its
    /// own task; its outcome, panics included, does not affect the result.
    pub async fn run_with(
        &self,
        graph: &Arc<PipelineGraph>,
        run_id: RunId,
        cancel: CancelSignal,
    ) -> RunResult {
        let span = info_span!("run", graph = %graph.id(), run_id = %run_id);
        self.drive(graph, run_id, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        graph: &Arc<PipelineGraph>,
        run_id: RunId,
        cancel: CancelSignal,
    ) -> RunResult {
        let graph_id = graph.id().clone();
        let start_time = Instant::now();
        let executor = Arc::new(TaskExecutor::new(graph.max_concurrent_tasks()));
        let store = ContextStore::new();
        let state = Arc::new(Mutex::new(RunState::new(graph, run_id)));
        let mut in_flight = JoinSet::new();

        info!(
            groups = graph.topological_order().len(),
            tasks = graph.task_count(),
            "run started"
        );
        self.events
            .emit(Event::run_started(graph_id.clone(), run_id))
            .await;

        loop {
            let (ready, events) = {
                let mut state = state.lock().await;
                state.advance(graph, !cancel.is_cancelled())
            };
            for event in events {
                self.events.emit(event).await;
            }

            for task in ready {
                debug!(task = %task, "dispatching");
                self.dispatch(graph, run_id, task, &executor, &store, &state, &mut in_flight)
                    .await;
            }

            if in_flight.join_next().await.is_none() {
                break;
            }
        }

        let (status, events, result) = {
            let mut state = state.lock().await;
            let mut events = Vec::new();
            let status = state.finish(graph, &mut events);
            let failure = match (&state.first_failure, status) {
                (Some(task), RunStatus::Failed) => {
                    let (attempts, error) = state
                        .results
                        .get(task)
                        .map(|r| (r.attempts, r.error.clone().unwrap_or_default()))
                        .unwrap_or_default();
                    Some(RunFailure {
                        graph_id: graph_id.clone(),
                        run_id,
                        failing_group: task.group.clone(),
                        failing_task: task.task.clone(),
                        attempts,
                        error,
                        diagnostic: RunFailure::diagnostic_ref(&run_id, &task.group, &task.task),
                    })
                }
                _ => None,
            };
            let result = RunResult {
                run_id,
                graph_id: graph_id.clone(),
                status,
                duration: start_time.elapsed(),
                task_results: state.results.clone(),
                task_statuses: state.tasks.clone(),
                group_statuses: state.groups.clone(),
                failure,
                outputs: store,
            };
            (status, events, result)
        };
        for event in events {
            self.events.emit(event).await;
        }

        match status {
            RunStatus::Succeeded => info!(duration_ms = %result.duration.as_millis(), "run succeeded"),
            RunStatus::Cancelled => warn!(skipped = result.skipped_tasks().len(), "run cancelled"),
            _ => warn!(
                failed = result.failed_tasks().len(),
                skipped = result.skipped_tasks().len(),
                "run failed"
            ),
        }
        self.events
            .emit(Event::run_finished(graph_id, run_id, status, result.duration))
            .await;

        if let (Some(failure), Some(observer)) = (&result.failure, graph.failure_observer()) {
            let observer = observer.clone();
            let failure = failure.clone();
            let notified = tokio::spawn(async move { observer.on_failure(&failure).await }).await;
            if let Err(e) = notified {
                warn!(error = %e, "failure observer panicked");
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        graph: &Arc<PipelineGraph>,
        run_id: RunId,
        task: TaskRef,
        executor: &Arc<TaskExecutor>,
        store: &ContextStore,
        state: &Arc<Mutex<RunState>>,
        in_flight: &mut JoinSet<()>,
    ) {
        let node = graph
            .group(&task.group)
            .and_then(|g| g.task(&task.task))
            .cloned();
        let inputs = store.scoped(&graph.upstream_prefixes(&task.group, &task.task));

        let (node, inputs) = match (node, inputs) {
            (Some(node), Ok(inputs)) => (node, inputs),
            (None, _) => {
                self.fail_undispatched(graph, state, task, "task not found in graph".to_string())
                    .await;
                return;
            }
            (_, Err(e)) => {
                self.fail_undispatched(graph, state, task, e.to_string()).await;
                return;
            }
        };

        let invocation = Invocation {
            graph_id: graph.id().clone(),
            run_id,
            task: task.clone(),
            inputs,
            config: graph.environment().clone(),
        };
        let graph = Arc::clone(graph);
        let executor = Arc::clone(executor);
        let store = store.clone();
        let state = Arc::clone(state);
        let events = Arc::clone(&self.events);
        let span = info_span!("task", group = %task.group, task = %task.task);

        in_flight.spawn(
            async move {
                // A nested task so a panicking task body surfaces as a failure
                // of that task instead of tearing down the run.
                let attempt = {
                    let events = Arc::clone(&events);
                    tokio::spawn(
                        async move { executor.execute(&node, invocation, &store, &events).await }
                            .in_current_span(),
                    )
                };
                let result = match attempt.await {
                    Ok(result) => result,
                    Err(e) => {
                        let error = format!("task panicked: {}", e);
                        events
                            .emit(Event::task_failed(
                                graph.id().clone(),
                                run_id,
                                task.clone(),
                                1,
                                error.clone(),
                            ))
                            .await;
                        TaskResult::failure(task, 1, Duration::ZERO, error)
                    }
                };

                let follow_up = state.lock().await.record(&graph, result);
                for event in follow_up {
                    events.emit(event).await;
                }
            }
            .instrument(span),
        );
    }

    async fn fail_undispatched(
        &self,
        graph: &PipelineGraph,
        state: &Arc<Mutex<RunState>>,
        task: TaskRef,
        error: String,
    ) {
        warn!(task = %task, error = %error, "task could not be dispatched");
        let result = TaskResult::failure(task, 0, Duration::ZERO, error);
        let events = state.lock().await.record(graph, result);
        for event in events {
            self.events.emit(event).await;
        }
    }
}

impl Default for GraphExecutor {
    fn default() -> Self {
        Self::new()
    }
}
