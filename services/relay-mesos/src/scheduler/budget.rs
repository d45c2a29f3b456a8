//! Failure circuit breaker.

use crate::driver::TaskState;

/// Clamped failure score against a threshold.
///
/// Failed and Lost add one; Running and Finished take one away, never going
/// below zero. The breaker is tripped while `score > threshold`. A negative
/// threshold disables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureBudget {
    score: u64,
    threshold: i64,
}

impl FailureBudget {
    pub fn new(threshold: i64) -> Self {
        Self {
            score: 0,
            threshold,
        }
    }

    /// Applies one status transition. Returns whether the breaker is tripped
    /// afterwards.
    pub fn record(&mut self, state: TaskState) -> bool {
        match state {
            TaskState::Failed | TaskState::Lost => {
                self.score = self.score.saturating_add(1);
            }
            TaskState::Running | TaskState::Finished => {
                self.score = self.score.saturating_sub(1);
            }
            TaskState::Staging | TaskState::Starting | TaskState::Killed => {}
        }
        self.is_tripped()
    }

    pub fn is_tripped(&self) -> bool {
        u64::try_from(self.threshold).is_ok_and(|threshold| self.score > threshold)
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold >= 0
    }

    pub fn score(&self) -> u64 {
        self.score
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }
}
