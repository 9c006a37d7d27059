//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Triggering graphs at scheduled times
//! - Manual triggers and cancellation
//! - Keeping at most one in-flight run per graph, across processes that
//!   share a store
//! - Pause and resume
//! - Recovery of runs interrupted by a crash
//!
//! Run history is written by a [`HistoryRecorder`] registered on the
//! scheduler's event bus when it starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::graph::PipelineGraph;
use crate::core::types::{GraphId, RunId};
use crate::events::EventBus;
use crate::execution::{CancelSignal, GraphExecutor};
use crate::storage::{HistoryRecorder, LeaseGrant, RunLease, Storage};

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::types::{RunWatch, SchedulerCommand, SchedulerError, SchedulerState};

/// Upper bound when counting missed occurrences between two ticks.
const MAX_COUNT_ITERATIONS: usize = 100;

/// Default lifetime of a run lease between renewals.
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Bookkeeping for one in-flight run.
struct ActiveRun {
    graph_id: GraphId,
    cancel: CancelSignal,
    done: RunWatch,
    handle: JoinHandle<()>,
}

impl ActiveRun {
    fn is_finished(&self) -> bool {
        self.handle.is_finished() || self.done.borrow().is_some()
    }
}

fn lease_expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

/// Main scheduler for pipeline runs.
pub struct Scheduler {
    /// Registered graphs.
    graphs: HashMap<GraphId, Arc<PipelineGraph>>,
    /// Run history backend.
    storage: Arc<dyn Storage>,
    /// Event bus shared by every run.
    event_bus: Arc<EventBus>,
    /// Tick interval for checking schedules.
    tick_interval: Duration,
    /// In-flight runs.
    active_runs: HashMap<RunId, ActiveRun>,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
    /// Lifetime of a run lease; renewed every third of it.
    lease_ttl: Duration,
    /// Name written into the leases this scheduler takes.
    holder: String,
}

impl Scheduler {
    /// Create a new scheduler over shared storage.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            graphs: HashMap::new(),
            storage,
            event_bus: Arc::new(EventBus::new()),
            tick_interval: Duration::from_secs(1),
            active_runs: HashMap::new(),
            shutdown_timeout: Duration::from_secs(30),
            lease_ttl: DEFAULT_LEASE_TTL,
            holder: format!("pid-{}-{}", std::process::id(), Uuid::new_v4().simple()),
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set how long a run lease outlives its last renewal.
    ///
    /// A run of a crashed process keeps its graph blocked, and out of
    /// [`recover`](Self::recover)'s reach, for at most this long.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Register a graph. A graph with the same id is replaced.
    pub fn register(&mut self, graph: impl Into<Arc<PipelineGraph>>) {
        let graph = graph.into();
        self.graphs.insert(graph.id().clone(), graph);
    }

    /// Get a registered graph by id.
    pub fn graph(&self, id: &GraphId) -> Option<&Arc<PipelineGraph>> {
        self.graphs.get(id)
    }

    /// List all registered graphs.
    pub fn graphs(&self) -> impl Iterator<Item = &Arc<PipelineGraph>> {
        self.graphs.values()
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Close every run left unfinished by a previous process as `Interrupted`.
    ///
    /// Call before [`start`](Self::start). Runs whose lease is still being
    /// renewed belong to a live scheduler and are left alone. Nothing is
    /// resumed: re-triggering the graph is safe because its sync stages skip
    /// completed work.
    pub async fn recover(&self) -> Result<Vec<RunId>, SchedulerError> {
        let interrupted = self.storage.mark_unfinished_interrupted().await?;
        for run_id in &interrupted {
            warn!(run_id = %run_id, "marked interrupted run");
        }
        Ok(interrupted)
    }

    /// Start the scheduler and return a handle for controlling it.
    pub async fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        self.event_bus
            .register(Arc::new(HistoryRecorder::new(Arc::clone(&self.storage))))
            .await;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        (handle, scheduler_task)
    }

    /// Main scheduler loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut interval = tokio::time::interval(self.tick_interval);
        let mut last_check = Utc::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.cleanup_finished_runs();

                    let current_state = *state.read().await;
                    if current_state == SchedulerState::Running {
                        let now = Utc::now();
                        self.check_schedules(last_check, now).await;
                        last_check = now;
                    }
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        // Every handle dropped.
                        self.await_active_runs().await;
                        break;
                    };
                    match command {
                        SchedulerCommand::Trigger { graph_id, response } => {
                            let result = self.trigger_graph(&graph_id).await;
                            let _ = response.send(result);
                        }
                        SchedulerCommand::Cancel { run_id, response } => {
                            let _ = response.send(self.cancel_run(&run_id));
                        }
                        SchedulerCommand::Watch { run_id, response } => {
                            let result = self
                                .active_runs
                                .get(&run_id)
                                .map(|run| run.done.clone())
                                .ok_or_else(|| SchedulerError::RunNotFound(run_id.to_string()));
                            let _ = response.send(result);
                        }
                        SchedulerCommand::Pause { response } => {
                            *state.write().await = SchedulerState::Paused;
                            info!("scheduler paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Resume { response } => {
                            *state.write().await = SchedulerState::Running;
                            // Occurrences that fell inside the pause are dropped.
                            last_check = Utc::now();
                            info!("scheduler resumed, skipping occurrences missed while paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            *state.write().await = SchedulerState::Stopped;
                            self.await_active_runs().await;
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }

        *state.write().await = SchedulerState::Stopped;
    }

    /// Trigger every graph with an occurrence in `(last_check, now]`.
    ///
    /// Several missed occurrences (a slow tick) still trigger only once.
    async fn check_schedules(&mut self, last_check: DateTime<Utc>, now: DateTime<Utc>) {
        let due: Vec<GraphId> = self
            .graphs
            .values()
            .filter_map(|graph| {
                let schedule = graph.schedule()?;
                let occurrences =
                    schedule.occurrences_between(last_check, now, MAX_COUNT_ITERATIONS);
                if occurrences == 0 {
                    return None;
                }
                if occurrences >= MAX_COUNT_ITERATIONS {
                    warn!(
                        graph = %graph.id(),
                        %last_check,
                        %now,
                        missed_occurrences = format!("{}+", occurrences),
                        "many scheduled occurrences missed, triggering once"
                    );
                } else if occurrences > 1 {
                    warn!(
                        graph = %graph.id(),
                        %last_check,
                        %now,
                        missed_occurrences = occurrences,
                        "multiple scheduled occurrences missed, triggering once"
                    );
                } else {
                    debug!(graph = %graph.id(), %now, "found scheduled occurrence");
                }
                Some(graph.id().clone())
            })
            .collect();

        for graph_id in due {
            info!(graph = %graph_id, "triggering scheduled run");
            if let Err(e) = self.trigger_graph(&graph_id).await {
                warn!(graph = %graph_id, error = %e, "scheduled trigger rejected");
            }
        }
    }

    /// Start a run of `graph_id` on its own task.
    ///
    /// The run holds the graph's lease in storage until it finishes, so a
    /// second scheduler over the same store refuses to start another.
    async fn trigger_graph(
        &mut self,
        graph_id: &GraphId,
    ) -> Result<(RunId, RunWatch), SchedulerError> {
        let graph = self
            .graphs
            .get(graph_id)
            .cloned()
            .ok_or_else(|| SchedulerError::GraphNotFound(graph_id.to_string()))?;

        self.cleanup_finished_runs();
        let in_flight = self
            .active_runs
            .iter()
            .filter(|(_, run)| &run.graph_id == graph_id)
            .map(|(run_id, _)| *run_id)
            .next();
        if let Some(run_id) = in_flight {
            return Err(SchedulerError::RunAlreadyActive {
                graph: graph_id.to_string(),
                run_id,
            });
        }

        let run_id = RunId::new();
        let lease = RunLease {
            graph_id: graph_id.clone(),
            run_id,
            holder: self.holder.clone(),
            expires_at: lease_expiry(self.lease_ttl),
        };
        if let LeaseGrant::Held(held) = self.storage.acquire_lease(&lease).await? {
            info!(
                graph = %graph_id,
                run_id = %held.run_id,
                holder = %held.holder,
                "graph leased by another scheduler"
            );
            return Err(SchedulerError::RunAlreadyActive {
                graph: graph_id.to_string(),
                run_id: held.run_id,
            });
        }

        let cancel = CancelSignal::new();
        let (done_tx, done_rx) = watch::channel(None);
        let executor = GraphExecutor::with_events(Arc::clone(&self.event_bus));
        let run_cancel = cancel.clone();
        let storage = Arc::clone(&self.storage);
        let lease_ttl = self.lease_ttl;
        let lease_graph = graph_id.clone();

        let handle = tokio::spawn(async move {
            let run = executor.run_with(&graph, run_id, run_cancel);
            tokio::pin!(run);
            let mut renew = tokio::time::interval((lease_ttl / 3).max(Duration::from_millis(10)));
            renew.tick().await;

            let result = loop {
                tokio::select! {
                    result = &mut run => break result,
                    _ = renew.tick() => {
                        match storage
                            .renew_lease(&lease_graph, &run_id, lease_expiry(lease_ttl))
                            .await
                        {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(graph = %lease_graph, run_id = %run_id, "run lease lost")
                            }
                            Err(e) => warn!(
                                graph = %lease_graph,
                                run_id = %run_id,
                                error = %e,
                                "failed to renew run lease"
                            ),
                        }
                    }
                }
            };

            // Released before waiters see the result, so they can trigger again.
            if let Err(e) = storage.release_lease(&lease_graph, &run_id).await {
                warn!(
                    graph = %lease_graph,
                    run_id = %run_id,
                    error = %e,
                    "failed to release run lease"
                );
            }
            // Nobody waiting is fine.
            let _ = done_tx.send(Some(result));
        });

        info!(graph = %graph_id, run_id = %run_id, "run triggered");
        self.active_runs.insert(
            run_id,
            ActiveRun {
                graph_id: graph_id.clone(),
                cancel,
                done: done_rx.clone(),
                handle,
            },
        );

        Ok((run_id, done_rx))
    }

    fn cancel_run(&self, run_id: &RunId) -> Result<(), SchedulerError> {
        let run = self
            .active_runs
            .get(run_id)
            .ok_or_else(|| SchedulerError::RunNotFound(run_id.to_string()))?;
        info!(graph = %run.graph_id, run_id = %run_id, "cancelling run");
        run.cancel.cancel();
        Ok(())
    }

    /// Drop bookkeeping of finished runs.
    fn cleanup_finished_runs(&mut self) {
        self.active_runs.retain(|_, run| !run.is_finished());
    }

    /// Wait for in-flight runs to complete, up to the shutdown timeout.
    async fn await_active_runs(&mut self) {
        self.cleanup_finished_runs();
        let running_count = self.active_runs.len();

        if running_count == 0 {
            info!("no active runs to wait for during shutdown");
            return;
        }

        info!(
            "graceful shutdown: waiting for {} active run(s) to complete (timeout: {:?})",
            running_count, self.shutdown_timeout
        );

        let start = tokio::time::Instant::now();
        let deadline = start + self.shutdown_timeout;

        loop {
            self.cleanup_finished_runs();
            let remaining = self.active_runs.len();

            if remaining == 0 {
                info!("all active runs completed gracefully in {:?}", start.elapsed());
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "graceful shutdown timeout ({:?}) exceeded with {} run(s) still active",
                    self.shutdown_timeout, remaining
                );
                break;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
