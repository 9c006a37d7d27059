//! Task execution engine.
//!
//! This module provides the execution infrastructure for running tasks and
//! whole pipeline graphs.

mod cancel;
mod executor;
mod graph_executor;

pub use cancel::CancelSignal;
pub use executor::{Invocation, TaskExecutor, TaskResult};
pub use graph_executor::{GraphExecutor, RunResult};
