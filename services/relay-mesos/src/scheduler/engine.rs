//! The scheduler event loop.
//!
//! ```text
//!            Registered                 Offers
//! Unregistered ─────────▶ Registered ◀──────────┐
//!      │ (gate released)      │  take() demand,  │
//!      │                      │  place, launch,  │
//!      │ Offers: decline all  │  decline rest ───┘
//!      ▼                      │
//!   (declined)                │ Update: track task, adjust budget,
//!                             │         trip breaker
//!                             ▼
//!                  Stopped → clean exit, anything else → fault
//! ```

use std::sync::Arc;

use relay_id::{FrameworkId, OfferId};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::budget::FailureBudget;
use super::error::{SchedulerError, SchedulerResult};
use super::offers::plan_round;
use super::tasks::{TaskRecord, TaskTable};
use super::SchedulerSettings;
use crate::driver::{
    ClusterDriver, Connector, DriverError, DriverEvent, ResourceOffer, TaskSpec, TaskState,
    TaskStatusUpdate,
};
use crate::shared::{Direction, Fault, Shared, Unit};

/// Most tasks one offer round launches. Demand beyond this is dropped with
/// the rest of the shortfall.
pub const MAX_TASKS_PER_ROUND: u64 = 1_000;

/// Registration with the cluster manager. Never goes back to
/// `Unregistered` once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Unregistered,
    Registered { framework_id: FrameworkId },
}

/// How the scheduler unit ended without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    /// The manager confirmed the driver stopped.
    DriverStopped,
    /// The supervisor asked the unit to stop.
    Shutdown,
}

/// Binds the driver and runs the scheduler until it exits.
///
/// A binding that cannot be constructed is reported as a fault before any
/// registration is attempted, so the readiness gate stays closed.
pub async fn run_scheduler(
    connector: Connector,
    settings: SchedulerSettings,
    shared: Shared,
    shutdown: watch::Receiver<bool>,
) -> SchedulerResult<SchedulerExit> {
    let driver = match connector() {
        Ok(driver) => driver,
        Err(e) => {
            let reason = match e {
                DriverError::Unavailable(reason) => reason,
                other => other.to_string(),
            };
            let err = SchedulerError::BindingUnavailable(reason);
            report(&shared, &err);
            return Err(err);
        }
    };

    SchedulerEngine::new(driver, settings, shared)
        .run(shutdown)
        .await
}

fn report(shared: &Shared, err: &SchedulerError) {
    error!(error = %err, kind = err.kind(), "Scheduler failed");
    shared
        .faults
        .report(Fault::new(Unit::Scheduler, err.kind(), err.to_string()));
}

pub struct SchedulerEngine {
    driver: Arc<dyn ClusterDriver>,
    settings: SchedulerSettings,
    shared: Shared,
    registration: Registration,
    tasks: TaskTable,
    budget: FailureBudget,
}

impl SchedulerEngine {
    pub fn new(driver: Arc<dyn ClusterDriver>, settings: SchedulerSettings, shared: Shared) -> Self {
        let budget = FailureBudget::new(settings.max_failures);
        Self {
            driver,
            settings,
            shared,
            registration: Registration::Unregistered,
            tasks: TaskTable::new(),
            budget,
        }
    }

    /// Runs until the driver stops, shutdown is signalled, or a fault.
    ///
    /// Faults are reported on the fault channel before returning. A tripped
    /// breaker also stops the driver.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<SchedulerExit> {
        let result = self.drive(&mut shutdown).await;
        if let Err(e) = &result {
            report(&self.shared, e);
            if matches!(e, SchedulerError::BreakerTripped { .. }) {
                self.stop_driver().await;
            }
        }
        result
    }

    async fn drive(&mut self, shutdown: &mut watch::Receiver<bool>) -> SchedulerResult<SchedulerExit> {
        info!(
            framework = %self.settings.framework.name,
            max_failures = self.budget.threshold(),
            task_resources = %self.settings.task.resources,
            "Starting scheduler"
        );

        let mut events = self.driver.subscribe(&self.settings.framework).await?;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(SchedulerError::Disconnected {
                            reason: "event stream closed".to_string(),
                        });
                    };
                    if let Some(exit) = self.handle_event(event).await? {
                        return Ok(exit);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler received shutdown signal");
                        self.stop_driver().await;
                        return Ok(SchedulerExit::Shutdown);
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: DriverEvent) -> SchedulerResult<Option<SchedulerExit>> {
        match event {
            DriverEvent::Registered { framework_id } => self.on_registered(framework_id),
            DriverEvent::Offers(offers) => self.on_offers(offers).await?,
            DriverEvent::Rescinded(offer_id) => {
                debug!(offer_id = %offer_id, "Offer rescinded");
            }
            DriverEvent::Update(update) => self.on_update(update)?,
            DriverEvent::Error { message } => return Err(SchedulerError::Manager(message)),
            DriverEvent::Disconnected { reason } => {
                return Err(SchedulerError::Disconnected { reason })
            }
            DriverEvent::Stopped => {
                info!("Cluster manager driver stopped");
                return Ok(Some(SchedulerExit::DriverStopped));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    fn on_registered(&mut self, framework_id: FrameworkId) {
        match &self.registration {
            Registration::Unregistered => {
                info!(framework_id = %framework_id, "Registered with cluster manager");
            }
            Registration::Registered { framework_id: previous } => {
                info!(
                    framework_id = %framework_id,
                    previous = %previous,
                    "Re-registered with cluster manager"
                );
            }
        }
        self.registration = Registration::Registered { framework_id };

        if self.shared.gate.release() {
            info!("Readiness gate released");
        }
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    fn is_registered(&self) -> bool {
        matches!(self.registration, Registration::Registered { .. })
    }

    // =========================================================================
    // Offer rounds
    // =========================================================================

    async fn on_offers(&mut self, offers: Vec<ResourceOffer>) -> SchedulerResult<()> {
        let offer_ids: Vec<OfferId> = offers.iter().map(|o| o.id.clone()).collect();

        if !self.is_registered() {
            debug!(offers = offer_ids.len(), "Declining offers received before registration");
            return self.decline(&offer_ids).await;
        }

        let demand = self.shared.demand.take();
        let Some(direction) = Direction::of(demand) else {
            debug!(offers = offer_ids.len(), "No outstanding demand, declining offers");
            return self.decline(&offer_ids).await;
        };
        let magnitude = demand.unsigned_abs();

        if self.settings.task.command(direction).is_none() {
            warn!(
                direction = %direction,
                magnitude,
                "No command configured for direction, dropping demand"
            );
            return self.decline(&offer_ids).await;
        }

        let plan = plan_round(
            &offers,
            &self.settings.task.resources,
            magnitude.min(MAX_TASKS_PER_ROUND),
        );

        for placement in &plan.placements {
            let specs: Vec<TaskSpec> = (0..placement.count)
                .filter_map(|_| self.settings.task.build(direction, &placement.agent_id))
                .collect();
            let records: Vec<TaskRecord> = specs.iter().map(TaskRecord::staged).collect();

            self.driver
                .launch(std::slice::from_ref(&placement.offer_id), specs)
                .await?;

            for record in records {
                debug!(task_id = %record.task_id, direction = %direction, "Task staged");
                self.tasks.insert(record);
            }
            info!(
                offer_id = %placement.offer_id,
                agent_id = %placement.agent_id,
                direction = %direction,
                tasks = placement.count,
                "Launched tasks"
            );
        }

        let placed = plan.placed();
        if placed < magnitude {
            warn!(
                direction = %direction,
                requested = magnitude,
                placed,
                dropped = magnitude - placed,
                "Offers exhausted, dropping unplaced demand"
            );
        }

        self.decline(&plan.unused).await
    }

    async fn decline(&self, offer_ids: &[OfferId]) -> SchedulerResult<()> {
        if offer_ids.is_empty() {
            return Ok(());
        }
        debug!(offers = offer_ids.len(), "Declining offers");
        self.driver.decline(offer_ids).await?;
        Ok(())
    }

    // =========================================================================
    // Status updates
    // =========================================================================

    fn on_update(&mut self, update: TaskStatusUpdate) -> SchedulerResult<()> {
        let TaskStatusUpdate {
            task_id,
            state,
            message,
        } = update;

        match self.tasks.transition(&task_id, state) {
            Some(previous) => {
                debug!(task_id = %task_id, from = %previous, to = %state, "Task status update");
            }
            None => {
                warn!(task_id = %task_id, state = %state, "Status update for unknown task");
            }
        }

        let tripped = self.budget.record(state);

        if matches!(state, TaskState::Failed | TaskState::Lost) {
            warn!(
                task_id = %task_id,
                state = %state,
                reason = message.as_deref().unwrap_or(""),
                score = self.budget.score(),
                threshold = self.budget.threshold(),
                "Task failed"
            );
        }

        if state.is_terminal() {
            self.tasks.remove(&task_id);
        }

        if tripped {
            return Err(SchedulerError::BreakerTripped {
                score: self.budget.score(),
                threshold: self.budget.threshold(),
            });
        }
        Ok(())
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn budget(&self) -> &FailureBudget {
        &self.budget
    }

    async fn stop_driver(&self) {
        if let Err(e) = self.driver.stop().await {
            warn!(error = %e, "Failed to stop cluster manager driver");
        }
    }
}
