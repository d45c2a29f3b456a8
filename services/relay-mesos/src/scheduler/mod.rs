//! Cluster scheduler engine.
//!
//! Registers with the cluster manager, turns the outstanding demand into
//! task launches on each offer round, tracks task status, and trips a
//! failure breaker when too many tasks fail.
//!
//! - `engine`: event loop and state machine
//! - `offers`: greedy matching of demand against an offer round
//! - `tasks`: task template and the active task table
//! - `budget`: the failure circuit breaker

mod budget;
mod engine;
mod error;
mod offers;
mod tasks;

pub use budget::FailureBudget;
pub use engine::{
    run_scheduler, Registration, SchedulerEngine, SchedulerExit, MAX_TASKS_PER_ROUND,
};
pub use error::{SchedulerError, SchedulerResult};
pub use offers::{plan_round, OfferPlan, Placement};
pub use tasks::{TaskRecord, TaskTable, TaskTemplate};

use crate::driver::FrameworkInfo;

/// Everything the scheduler unit needs from configuration.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub framework: FrameworkInfo,
    pub task: TaskTemplate,
    /// Breaker threshold; negative disables the breaker.
    pub max_failures: i64,
}
