//! First-fault channel from the worker units to the supervisor.
//!
//! Only the first fault ever reported is delivered. Later reports are
//! dropped: by then the supervisor is already tearing everything down.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

/// The two supervised units of execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    ControlLoop,
    Scheduler,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlLoop => "control_loop",
            Self::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unhandled fault raised inside a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Unit that raised it.
    pub unit: Unit,
    /// Stable label, e.g. `breaker_tripped`.
    pub kind: &'static str,
    /// Human readable description.
    pub reason: String,
}

impl Fault {
    pub fn new(unit: Unit, kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            unit,
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fault ({}): {}", self.unit, self.kind, self.reason)
    }
}

/// Creates a connected fault sender and receiver.
pub fn fault_channel() -> (FaultSender, FaultReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (
        FaultSender {
            tx,
            latched: Arc::new(AtomicBool::new(false)),
        },
        FaultReceiver { rx },
    )
}

/// Write side, held by the worker units.
#[derive(Debug, Clone)]
pub struct FaultSender {
    tx: mpsc::Sender<Fault>,
    latched: Arc<AtomicBool>,
}

impl FaultSender {
    /// Reports a fault. Returns `true` if this was the first one.
    pub fn report(&self, fault: Fault) -> bool {
        if self.latched.swap(true, Ordering::SeqCst) {
            debug!(fault = %fault, "Fault already reported, dropping");
            return false;
        }
        // Capacity is one and only the first report gets here.
        self.tx.try_send(fault).is_ok()
    }
}

/// Read side, held by the supervisor.
#[derive(Debug)]
pub struct FaultReceiver {
    rx: mpsc::Receiver<Fault>,
}

impl FaultReceiver {
    /// Non-blocking check for a delivered fault.
    pub fn poll(&mut self) -> Option<Fault> {
        self.rx.try_recv().ok()
    }
}
