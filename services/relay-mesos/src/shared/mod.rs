//! Coordination primitives shared by the control loop and the scheduler.
//!
//! ```text
//!   control loop ──merge──▶ DemandCell ◀──take── scheduler
//!        │                                         │
//!        └──wait──▶ ReadinessGate ◀──release───────┤
//!                                                  │
//!   supervisor ◀──poll── FaultChannel ◀──report────┘ (and control loop)
//! ```
//!
//! Nothing else crosses the boundary between the two units.

pub mod demand;
pub mod fault;
pub mod gate;

pub use demand::{DemandCell, Direction};
pub use fault::{fault_channel, Fault, FaultReceiver, FaultSender, Unit};
pub use gate::ReadinessGate;

/// Handles to the primitives, as given to each unit.
#[derive(Debug, Clone)]
pub struct Shared {
    pub demand: DemandCell,
    pub gate: ReadinessGate,
    pub faults: FaultSender,
}

impl Shared {
    pub fn new(faults: FaultSender) -> Self {
        Self {
            demand: DemandCell::new(),
            gate: ReadinessGate::new(),
            faults,
        }
    }
}
