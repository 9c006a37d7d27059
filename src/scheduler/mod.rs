//! Scheduler for pipeline runs.
//!
//! This module provides the main scheduling loop that triggers graphs at
//! scheduled times, enforces one in-flight run per graph and recovers runs
//! interrupted by a crash.

mod engine;
mod handle;
mod types;

pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use types::{SchedulerError, SchedulerState};
