//! Demand cell: the outstanding scale request.
//!
//! A single signed integer behind a mutex. The magnitude is the number of
//! tasks requested, the sign the direction (`> 0` warmer, `< 0` cooler).
//! Between two offer rounds only the largest request survives; an offer
//! round consumes whatever is there and leaves zero behind.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Scale direction of a request or a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Positive demand.
    Warmer,
    /// Negative demand.
    Cooler,
}

impl Direction {
    /// Direction of a signed demand, `None` for zero.
    pub fn of(value: i64) -> Option<Self> {
        match value.signum() {
            1 => Some(Self::Warmer),
            -1 => Some(Self::Cooler),
            _ => None,
        }
    }

    /// Applies this direction's sign to a magnitude, saturating at `i64`.
    pub fn signed(self, magnitude: u64) -> i64 {
        let value = i64::try_from(magnitude).unwrap_or(i64::MAX);
        match self {
            Self::Warmer => value,
            Self::Cooler => -value,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warmer => "warmer",
            Self::Cooler => "cooler",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared signed counter of outstanding demand.
///
/// Cloning yields another handle to the same cell.
#[derive(Debug, Clone, Default)]
pub struct DemandCell {
    value: Arc<Mutex<i64>>,
}

impl DemandCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored value with `n` iff `|n| >= |current|`.
    ///
    /// Equal magnitudes replace, so the most recent request wins a tie
    /// between opposite directions. Returns whether the value was replaced.
    pub fn merge(&self, n: i64) -> bool {
        let mut current = self.lock();
        if n.unsigned_abs() >= current.unsigned_abs() {
            *current = n;
            true
        } else {
            false
        }
    }

    /// Returns the stored value and resets it to zero.
    pub fn take(&self) -> i64 {
        std::mem::take(&mut *self.lock())
    }

    /// Returns the stored value without consuming it.
    pub fn peek(&self) -> i64 {
        *self.lock()
    }

    // Poison is ignored: the guarded value is a plain integer.
    fn lock(&self) -> MutexGuard<'_, i64> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
