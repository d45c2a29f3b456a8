//! Control-loop unit.
//!
//! Waits for the readiness gate, then runs the feedback loop with its two
//! scale callbacks bound to the demand cell. A callback only merges into the
//! cell; launching tasks is the scheduler's job.

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::feedback::FeedbackLoop;
use crate::shared::{DemandCell, Direction, Fault, Shared, Unit};

/// Callback slot handed to the feedback loop, bound to one direction.
#[derive(Debug, Clone)]
pub struct ScaleCallback {
    cell: DemandCell,
    direction: Direction,
}

impl ScaleCallback {
    pub fn new(cell: DemandCell, direction: Direction) -> Self {
        Self { cell, direction }
    }

    /// Requests `n` tasks. Only the magnitude of `n` is used; the sign comes
    /// from the slot.
    pub fn call(&self, n: i64) {
        let signed = self.direction.signed(n.unsigned_abs());
        let replaced = self.cell.merge(signed);
        debug!(direction = %self.direction, n = signed, replaced, "Scale request");
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// The callback slots given to the feedback loop. A slot is bound only when
/// its direction has a command configured.
#[derive(Debug, Clone)]
pub struct ScaleHandles {
    pub warmer: Option<ScaleCallback>,
    pub cooler: Option<ScaleCallback>,
}

impl ScaleHandles {
    pub fn new(cell: &DemandCell, warmer: bool, cooler: bool) -> Self {
        Self {
            warmer: warmer.then(|| ScaleCallback::new(cell.clone(), Direction::Warmer)),
            cooler: cooler.then(|| ScaleCallback::new(cell.clone(), Direction::Cooler)),
        }
    }

    pub fn get(&self, direction: Direction) -> Option<&ScaleCallback> {
        match direction {
            Direction::Warmer => self.warmer.as_ref(),
            Direction::Cooler => self.cooler.as_ref(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlLoopError {
    #[error("feedback loop failed: {0:#}")]
    Feedback(anyhow::Error),

    #[error("feedback loop returned")]
    Returned,
}

impl ControlLoopError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Feedback(_) => "feedback_failed",
            Self::Returned => "feedback_returned",
        }
    }
}

/// The control-loop unit of execution.
pub struct ControlLoop<F> {
    feedback: F,
    shared: Shared,
    handles: ScaleHandles,
}

impl<F: FeedbackLoop> ControlLoop<F> {
    pub fn new(feedback: F, shared: Shared, warmer: bool, cooler: bool) -> Self {
        let handles = ScaleHandles::new(&shared.demand, warmer, cooler);
        Self {
            feedback,
            shared,
            handles,
        }
    }

    /// Runs until shutdown (`Ok`) or until the feedback loop ends (`Err`).
    ///
    /// The loop never starts before the readiness gate is released. Errors
    /// are reported on the fault channel before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControlLoopError> {
        let Self {
            feedback,
            shared,
            handles,
        } = self;

        info!("Control loop waiting for scheduler registration");
        tokio::select! {
            _ = shared.gate.wait() => {}
            _ = wait_shutdown(&mut shutdown) => {
                info!("Control loop stopped before registration");
                return Ok(());
            }
        }
        info!(
            warmer = handles.warmer.is_some(),
            cooler = handles.cooler.is_some(),
            "Starting feedback loop"
        );

        let err = tokio::select! {
            result = feedback.run(handles) => match result {
                Ok(()) => ControlLoopError::Returned,
                Err(e) => ControlLoopError::Feedback(e),
            },
            _ = wait_shutdown(&mut shutdown) => {
                info!("Control loop received shutdown signal");
                return Ok(());
            }
        };

        error!(error = %err, kind = err.kind(), "Control loop failed");
        shared
            .faults
            .report(Fault::new(Unit::ControlLoop, err.kind(), err.to_string()));
        Err(err)
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::FnLoop;
    use crate::shared::fault_channel;
    use std::time::Duration;

    #[test]
    fn test_callbacks_apply_slot_sign() {
        let cell = DemandCell::new();
        let handles = ScaleHandles::new(&cell, true, true);

        handles.warmer.as_ref().unwrap().call(3);
        assert_eq!(cell.peek(), 3);

        handles.cooler.as_ref().unwrap().call(5);
        assert_eq!(cell.peek(), -5);

        // A negative argument on the warmer slot is still a warmer request.
        handles.warmer.as_ref().unwrap().call(-7);
        assert_eq!(cell.take(), 7);
    }

    #[test]
    fn test_unbound_slots() {
        let handles = ScaleHandles::new(&DemandCell::new(), true, false);
        assert!(handles.get(Direction::Warmer).is_some());
        assert!(handles.get(Direction::Cooler).is_none());
    }

    #[tokio::test]
    async fn test_waits_for_gate_before_running() {
        let (faults, _rx) = fault_channel();
        let shared = Shared::new(faults);
        let (_stop, shutdown) = watch::channel(false);

        let feedback = FnLoop::new(|scale: ScaleHandles| async move {
            if let Some(warmer) = &scale.warmer {
                warmer.call(2);
            }
            std::future::pending::<()>().await;
            Ok(())
        });
        let unit = tokio::spawn(ControlLoop::new(feedback, shared.clone(), true, true).run(shutdown));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shared.demand.peek(), 0);

        shared.gate.release();
        tokio::time::timeout(Duration::from_secs(1), async {
            while shared.demand.peek() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(shared.demand.peek(), 2);
        unit.abort();
    }

    #[tokio::test]
    async fn test_feedback_error_is_reported() {
        let (faults, mut rx) = fault_channel();
        let shared = Shared::new(faults);
        let (_stop, shutdown) = watch::channel(false);
        shared.gate.release();

        let feedback = FnLoop::new(|_scale| async { anyhow::bail!("metric command failed") });
        let result = ControlLoop::new(feedback, shared, true, false)
            .run(shutdown)
            .await;

        assert!(matches!(result, Err(ControlLoopError::Feedback(_))));
        let fault = rx.poll().unwrap();
        assert_eq!(fault.unit, Unit::ControlLoop);
        assert_eq!(fault.kind, "feedback_failed");
        assert!(fault.reason.contains("metric command failed"));
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_gate() {
        let (faults, mut rx) = fault_channel();
        let shared = Shared::new(faults);
        let (stop, shutdown) = watch::channel(false);

        let feedback = FnLoop::new(|_scale| async { Ok(()) });
        let unit = tokio::spawn(ControlLoop::new(feedback, shared, true, true).run(shutdown));
        stop.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), unit)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(rx.poll().is_none());
    }
}
