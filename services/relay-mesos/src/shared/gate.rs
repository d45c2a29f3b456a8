//! One-shot readiness gate.
//!
//! Released by the scheduler once the cluster manager acknowledges
//! registration. The control loop waits on it before producing any demand.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ReadinessGate {
    state: Arc<watch::Sender<bool>>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Opens the gate. Only the first call has an effect; it returns `true`.
    pub fn release(&self) -> bool {
        self.state.send_if_modified(|released| {
            if *released {
                false
            } else {
                *released = true;
                true
            }
        })
    }

    pub fn is_released(&self) -> bool {
        *self.state.borrow()
    }

    /// Waits until the gate is released. No timeout.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|released| *released).await;
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}
