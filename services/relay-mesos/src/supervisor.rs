//! Supervisor for the control-loop and scheduler units.
//!
//! ## Supervision
//!
//! ```text
//! Supervisor
//! ├── ControlLoop   (feedback loop → DemandCell)
//! └── Scheduler     (DemandCell → task launches, breaker)
//! ```
//!
//! There is no restart policy. The monitor loop polls the fault channel and
//! both units every `monitor_interval`; the first fault, unexpected unit
//! exit, or termination signal shuts everything down. The only successful
//! ending is the scheduler reporting a clean driver stop.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::control_loop::{ControlLoop, ControlLoopError};
use crate::driver::Connector;
use crate::feedback::FeedbackLoop;
use crate::scheduler::{run_scheduler, SchedulerExit, SchedulerResult, SchedulerSettings};
use crate::shared::{fault_channel, DemandCell, Fault, FaultReceiver, ReadinessGate, Shared, Unit};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Period of the monitor loop.
    pub monitor_interval: Duration,
    /// How long units get to stop before being aborted.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// How the system ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The cluster manager acknowledged a clean stop.
    CleanStop,
    /// A unit reported a fault.
    Fault(Fault),
    /// A unit ended without reporting a fault.
    UnitExited { unit: Unit, detail: String },
    /// An external termination signal was received.
    Terminated,
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::CleanStop => 0,
            _ => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

/// A spawned unit.
struct UnitHandle<T> {
    unit: Unit,
    task: JoinHandle<T>,
}

impl<T> UnitHandle<T> {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    fn abort(&self) {
        self.task.abort();
    }

    /// Joins a unit already known to be finished.
    async fn join(&mut self) -> Result<T, JoinError> {
        (&mut self.task).await
    }
}

pub struct Supervisor {
    settings: SupervisorSettings,
    shared: Shared,
    faults: FaultReceiver,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        let (tx, faults) = fault_channel();
        Self {
            settings,
            shared: Shared::new(tx),
            faults,
        }
    }

    /// The demand cell both units share.
    pub fn demand(&self) -> DemandCell {
        self.shared.demand.clone()
    }

    /// The readiness gate both units share.
    pub fn gate(&self) -> ReadinessGate {
        self.shared.gate.clone()
    }

    /// Spawns both units and supervises them until the system ends.
    ///
    /// `termination` resolves when an external termination request arrives;
    /// see [`termination_signal`].
    pub async fn run<F, S>(
        mut self,
        feedback: F,
        connector: Connector,
        scheduler: SchedulerSettings,
        termination: S,
    ) -> Outcome
    where
        F: FeedbackLoop,
        S: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let warmer = scheduler.task.warmer.is_some();
        let cooler = scheduler.task.cooler.is_some();

        info!(
            monitor_interval_ms = self.settings.monitor_interval.as_millis() as u64,
            "Starting supervisor"
        );

        let mut control = UnitHandle {
            unit: Unit::ControlLoop,
            task: tokio::spawn(
                ControlLoop::new(feedback, self.shared.clone(), warmer, cooler)
                    .run(shutdown_rx.clone()),
            ),
        };
        let mut sched = UnitHandle {
            unit: Unit::Scheduler,
            task: tokio::spawn(run_scheduler(
                connector,
                scheduler,
                self.shared.clone(),
                shutdown_rx,
            )),
        };

        let outcome = self.monitor(&mut control, &mut sched, termination).await;

        match &outcome {
            Outcome::CleanStop => info!("Cluster manager stopped cleanly, shutting down"),
            Outcome::Fault(fault) => error!(
                unit = %fault.unit,
                kind = fault.kind,
                reason = %fault.reason,
                "Fault received, shutting down"
            ),
            Outcome::UnitExited { unit, detail } => {
                error!(unit = %unit, detail = %detail, "Unit exited unexpectedly, shutting down")
            }
            Outcome::Terminated => warn!("Termination signal received, shutting down"),
        }

        self.shutdown(shutdown_tx, &control, &sched).await;
        info!(exit_code = outcome.exit_code(), "Supervisor finished");
        outcome
    }

    async fn monitor<S>(
        &mut self,
        control: &mut UnitHandle<Result<(), ControlLoopError>>,
        sched: &mut UnitHandle<SchedulerResult<SchedulerExit>>,
        termination: S,
    ) -> Outcome
    where
        S: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.settings.monitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(termination);

        loop {
            tokio::select! {
                _ = &mut termination => return Outcome::Terminated,
                _ = interval.tick() => {}
            }

            if let Some(fault) = self.faults.poll() {
                return Outcome::Fault(fault);
            }

            if !sched.is_running() {
                let joined = sched.join().await;
                return match joined {
                    Ok(Ok(SchedulerExit::DriverStopped)) => Outcome::CleanStop,
                    other => self.exited(sched.unit, describe(other)),
                };
            }

            if !control.is_running() {
                let joined = control.join().await;
                return self.exited(control.unit, describe(joined));
            }
        }
    }

    /// Outcome for a unit that ended. A fault it reported on the way out
    /// takes precedence.
    fn exited(&mut self, unit: Unit, detail: String) -> Outcome {
        match self.faults.poll() {
            Some(fault) => Outcome::Fault(fault),
            None => Outcome::UnitExited { unit, detail },
        }
    }

    async fn shutdown<A, B>(
        &self,
        shutdown_tx: watch::Sender<bool>,
        control: &UnitHandle<A>,
        sched: &UnitHandle<B>,
    ) {
        let _ = shutdown_tx.send(true);

        let deadline = Instant::now() + self.settings.shutdown_grace;
        while Instant::now() < deadline {
            if !control.is_running() && !sched.is_running() {
                break;
            }
            tokio::time::sleep(self.settings.monitor_interval).await;
        }

        if control.is_running() {
            warn!(unit = %control.unit, "Force aborting unit");
            control.abort();
        }
        if sched.is_running() {
            warn!(unit = %sched.unit, "Force aborting unit");
            sched.abort();
        }
    }
}

fn describe<T: std::fmt::Debug, E: std::fmt::Display>(
    joined: Result<Result<T, E>, JoinError>,
) -> String {
    match joined {
        Ok(Ok(value)) => format!("returned {value:?}"),
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_panic() => "panicked".to_string(),
        Err(e) => e.to_string(),
    }
}

/// Resolves on SIGINT or SIGTERM.
///
/// If a handler cannot be installed the failure is logged and that signal
/// is not watched.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
