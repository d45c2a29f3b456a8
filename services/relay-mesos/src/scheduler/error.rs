//! Scheduler error types.

use thiserror::Error;

use crate::driver::DriverError;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Everything that ends the scheduler unit with a fault.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cluster manager binding could not be loaded.
    #[error("cluster manager binding unavailable: {0}")]
    BindingUnavailable(String),

    #[error("failure breaker tripped: score {score} exceeds threshold {threshold}")]
    BreakerTripped { score: u64, threshold: i64 },

    #[error("disconnected from cluster manager: {reason}")]
    Disconnected { reason: String },

    #[error("cluster manager error: {0}")]
    Manager(String),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

impl SchedulerError {
    /// Stable label for logs and fault records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BindingUnavailable(_) => "binding_unavailable",
            Self::BreakerTripped { .. } => "breaker_tripped",
            Self::Disconnected { .. } => "disconnected",
            Self::Manager(_) => "manager_error",
            Self::Driver(_) => "driver_error",
        }
    }
}
