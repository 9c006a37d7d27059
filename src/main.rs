//! tributary - dependency-ordered batch pipelines with idempotent resume.
//!
//! Usage:
//!   tributary run <pipeline.yaml>       Run the scheduler for a pipeline
//!   tributary trigger <pipeline.yaml>   Run the pipeline once and wait for it
//!   tributary validate <pipeline.yaml>  Validate a pipeline definition
//!   tributary show <pipeline.yaml>      Print groups and tasks in dispatch order
//!   tributary history <pipeline.yaml>   List persisted runs of the pipeline

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tributary::{
    Event, EventBus, EventHandler, GraphId, PipelineGraph, PipelineLoader, RunId, RunStatus,
    RunSummary, Scheduler, Storage,
};

/// tributary - dependency-ordered batch pipelines with idempotent resume
#[derive(Parser)]
#[command(name = "tributary")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler for a pipeline until Ctrl+C
    Run {
        /// Path to the pipeline YAML file
        #[arg(value_name = "PIPELINE")]
        pipeline: PathBuf,

        /// Scheduler tick interval in seconds (default: 1)
        #[arg(long, default_value = "1")]
        tick_interval: u64,

        /// Seconds to wait for an in-flight run on shutdown (default: 30)
        #[arg(long, default_value = "30")]
        shutdown_timeout: u64,
    },

    /// Run the pipeline once and wait for it to finish
    Trigger {
        /// Path to the pipeline YAML file
        #[arg(value_name = "PIPELINE")]
        pipeline: PathBuf,
    },

    /// Validate a pipeline definition without running it
    Validate {
        /// Path to the pipeline YAML file
        #[arg(value_name = "PIPELINE")]
        pipeline: PathBuf,
    },

    /// Print groups and tasks in dispatch order
    Show {
        /// Path to the pipeline YAML file
        #[arg(value_name = "PIPELINE")]
        pipeline: PathBuf,
    },

    /// List persisted runs of the pipeline
    History {
        /// Path to the pipeline YAML file
        #[arg(value_name = "PIPELINE")]
        pipeline: PathBuf,

        /// Number of most recent runs to list
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,

        /// Show the tasks of one run
        #[arg(long, value_name = "RUN_ID")]
        run: Option<String>,
    },
}

/// Simple logging event handler that prints run events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::RunStarted {
                graph_id, run_id, ..
            } => {
                info!("Pipeline '{}' started (run: {})", graph_id, run_id);
            }
            Event::GroupStarted { group, .. } => {
                info!("  Group '{}' started", group);
            }
            Event::GroupFinished { group, status, .. } => {
                info!("  Group '{}' {}", group, status);
            }
            Event::TaskStarted { task, attempt, .. } => {
                if *attempt == 1 {
                    info!("    Task '{}' started", task);
                } else {
                    info!("    Task '{}' started (attempt {})", task, attempt);
                }
            }
            Event::TaskRetrying {
                task,
                attempt,
                max_attempts,
                error,
                ..
            } => {
                warn!(
                    "    Task '{}' attempt {}/{} failed, retrying: {}",
                    task, attempt, max_attempts, error
                );
            }
            Event::TaskSucceeded {
                task,
                attempts,
                duration,
                ..
            } => {
                info!(
                    "    Task '{}' succeeded in {:?} ({} attempt(s))",
                    task, duration, attempts
                );
            }
            Event::TaskFailed {
                task,
                attempts,
                error,
                ..
            } => {
                error!(
                    "    Task '{}' failed after {} attempt(s): {}",
                    task, attempts, error
                );
            }
            Event::TaskSkipped { task, .. } => {
                warn!("    Task '{}' skipped", task);
            }
            Event::RunFinished {
                graph_id,
                run_id,
                status,
                duration,
                ..
            } => {
                if *status == RunStatus::Succeeded {
                    info!(
                        "Pipeline '{}' succeeded in {:?} (run: {})",
                        graph_id, duration, run_id
                    );
                } else {
                    error!(
                        "Pipeline '{}' finished {} after {:?} (run: {})",
                        graph_id, status, duration, run_id
                    );
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            pipeline,
            tick_interval,
            shutdown_timeout,
        } => {
            run_scheduler(pipeline, tick_interval, shutdown_timeout).await?;
        }
        Commands::Trigger { pipeline } => {
            trigger_run(pipeline).await?;
        }
        Commands::Validate { pipeline } => {
            validate_pipeline(pipeline)?;
        }
        Commands::Show { pipeline } => {
            show_pipeline(pipeline)?;
        }
        Commands::History {
            pipeline,
            limit,
            run,
        } => {
            show_history(pipeline, limit, run).await?;
        }
    }

    Ok(())
}

/// Load and build a pipeline, opening its history storage.
async fn load(
    pipeline: &Path,
) -> Result<(Arc<PipelineGraph>, Arc<dyn Storage>), Box<dyn std::error::Error>> {
    info!("Loading pipeline from: {}", pipeline.display());
    let loader = PipelineLoader::from_file(pipeline)?;
    let graph = Arc::new(loader.build()?);
    let storage = loader.config().storage.open().await?;
    Ok((graph, storage))
}

/// Build a scheduler for one pipeline.
async fn scheduler_for(graph: Arc<PipelineGraph>, storage: Arc<dyn Storage>) -> Scheduler {
    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;

    let mut scheduler = Scheduler::new(storage).with_event_bus(event_bus);
    scheduler.register(graph);
    scheduler
}

/// Run the scheduler until Ctrl+C.
async fn run_scheduler(
    pipeline: PathBuf,
    tick_interval: u64,
    shutdown_timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let (graph, storage) = load(&pipeline).await?;

    match graph.schedule() {
        Some(schedule) => {
            let next = schedule
                .next()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|_| "never".to_string());
            info!(
                "Pipeline '{}': {} task(s), schedule {} (next: {})",
                graph.id(),
                graph.task_count(),
                schedule,
                next
            );
        }
        None => {
            warn!(
                "Pipeline '{}' has no schedule; it will only run when triggered",
                graph.id()
            );
        }
    }

    let scheduler = scheduler_for(graph, storage)
        .await
        .with_tick_interval(Duration::from_secs(tick_interval))
        .with_shutdown_timeout(Duration::from_secs(shutdown_timeout));

    // Close runs a crashed process left open. Runs still leased by a live
    // process are left alone.
    let interrupted = scheduler.recover().await?;
    if !interrupted.is_empty() {
        warn!("Marked {} interrupted run(s) from a previous process", interrupted.len());
    }

    info!("Starting scheduler (tick interval: {}s)...", tick_interval);
    info!("Press Ctrl+C to stop");

    let (handle, scheduler_task) = scheduler.start().await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
        }
    }

    Ok(())
}

/// Run the pipeline once; fails unless the run succeeds.
async fn trigger_run(pipeline: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let (graph, storage) = load(&pipeline).await?;
    let graph_id = graph.id().clone();

    // No recovery here: a running daemon may own the unfinished runs. The
    // graph's lease refuses this trigger while one of them is in flight.
    let scheduler = scheduler_for(graph, storage).await;
    let (handle, scheduler_task) = scheduler.start().await;

    let result = handle.trigger_and_wait(graph_id).await;
    handle.shutdown().await?;
    let _ = scheduler_task.await;
    let result = result?;

    if let Some(failure) = &result.failure {
        error!(
            "Failing task: {}.{} after {} attempt(s): {}",
            failure.failing_group, failure.failing_task, failure.attempts, failure.error
        );
        error!("Diagnostics: {}", failure.diagnostic);
    }

    if result.success() {
        Ok(())
    } else {
        Err(format!("run {} finished {}", result.run_id, result.status).into())
    }
}

/// Validate a pipeline definition without running it.
fn validate_pipeline(pipeline: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating pipeline: {}", pipeline.display());

    let result = PipelineLoader::from_file(&pipeline).and_then(|loader| loader.build());
    match result {
        Ok(graph) => {
            info!(
                "Pipeline '{}' ({}) is valid: {} group(s), {} task(s)",
                graph.id(),
                graph.name(),
                graph.topological_order().len(),
                graph.task_count()
            );
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Print groups and tasks in dispatch order.
fn show_pipeline(pipeline: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let graph = PipelineLoader::from_file(&pipeline)?.build()?;

    println!("ID: {}", graph.id());
    println!("  Name: {}", graph.name());
    match graph.schedule() {
        Some(schedule) => println!("  Schedule: {}", schedule),
        None => println!("  Schedule: manual only"),
    }
    println!("  Max concurrent tasks: {}", graph.max_concurrent_tasks());
    println!();

    for group_id in graph.topological_order() {
        let deps = graph.group_dependencies(group_id);
        if deps.is_empty() {
            println!("{}", group_id);
        } else {
            let dep_names: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
            println!("{} (after: {})", group_id, dep_names.join(", "));
        }

        let Some(group) = graph.group(group_id) else {
            continue;
        };
        for task_id in group.topological_order() {
            let Some(node) = group.task(task_id) else {
                continue;
            };
            let mut line = format!("  - {}", task_id);
            let deps = group.dependencies(task_id);
            if !deps.is_empty() {
                let dep_names: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
                line.push_str(&format!(" (depends on: {})", dep_names.join(", ")));
            }
            if node.retry.max_attempts > 0 {
                line.push_str(&format!(
                    " [retries: {} x {}s]",
                    node.retry.max_attempts,
                    node.retry.backoff.as_secs()
                ));
            }
            if let Some(timeout) = node.timeout {
                line.push_str(&format!(" [timeout: {}s]", timeout.as_secs()));
            }
            println!("{}", line);
        }
    }

    Ok(())
}

/// List persisted runs of the pipeline, or the tasks of one run.
async fn show_history(
    pipeline: PathBuf,
    limit: usize,
    run: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let loader = PipelineLoader::from_file(&pipeline)?;
    let storage = loader.config().storage.open().await?;

    if let Some(run) = run {
        let run_id = RunId::from_uuid(uuid::Uuid::parse_str(&run)?);
        let summary = storage.run_summary(&run_id).await?;
        print_summary(&summary);
        for (task, state) in &summary.tasks {
            let error = state
                .error
                .as_deref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default();
            println!(
                "  - {} {} ({} attempt(s)){}",
                task, state.status, state.attempts, error
            );
        }
        return Ok(());
    }

    let graph_id = GraphId::new(loader.config().id.as_str());
    let runs = storage.recent_runs(&graph_id, limit).await?;
    if runs.is_empty() {
        println!("No runs recorded for {}", graph_id);
        return Ok(());
    }
    for summary in &runs {
        print_summary(summary);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let finished = summary
        .finished_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<11}  started {}  finished {}",
        summary.run_id,
        summary.status.as_str(),
        summary.started_at.to_rfc3339(),
        finished
    );
}
