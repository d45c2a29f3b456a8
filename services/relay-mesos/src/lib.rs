//! Relay.Mesos library
//!
//! Bridges a continuously running feedback control loop to a resource-offer
//! cluster scheduler (Mesos). The loop decides how many warmer or cooler
//! tasks it wants; the scheduler turns that into task launches, subject to
//! the resources on offer and a failure circuit breaker.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//! ├── ControlLoop  ── waits on ReadinessGate, then runs the FeedbackLoop
//! │                   whose callbacks merge into the DemandCell
//! └── Scheduler    ── registers (releases the gate), take()s the DemandCell
//!                     on every offer round, launches tasks, tracks status,
//!                     trips the breaker
//! ```
//!
//! Any fault in either unit reaches the supervisor over the fault channel
//! and ends the whole system. There are no restarts and no retries.
//!
//! ## Modules
//!
//! - `shared`: demand cell, readiness gate, fault channel
//! - `control_loop`: the control-loop unit and its scale callbacks
//! - `feedback`: the feedback loop seam and the bundled metric loop
//! - `scheduler`: offer matching, task tracking, failure breaker
//! - `driver`: cluster manager bindings (Mesos HTTP API, in-process)
//! - `supervisor`: spawning, monitoring, shutdown

pub mod config;
pub mod control_loop;
pub mod driver;
pub mod feedback;
pub mod resources;
pub mod scheduler;
pub mod shared;
pub mod supervisor;

// Re-export commonly used types
pub use control_loop::{ScaleCallback, ScaleHandles};
pub use driver::{ClusterDriver, LocalCluster, MesosDriver};
pub use feedback::{FeedbackLoop, FnLoop, MetricLoop};
pub use resources::Resources;
pub use shared::{DemandCell, Direction, ReadinessGate};
pub use supervisor::{Outcome, Supervisor};
