//! In-process cluster manager.
//!
//! Two modes:
//!
//! - scripted ([`LocalCluster::new`]): nothing happens on its own. Tests
//!   drive registration, offers and status updates through the cluster
//!   handle and inspect the launch/decline/stop calls it recorded.
//! - autopilot ([`LocalCluster::autopilot`]): a single simulated agent.
//!   After subscribe it registers the framework, offers the agent's free
//!   resources every `offer_interval`, and runs launched tasks on this host
//!   with `sh -c`, reporting their status from the exit code.

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use relay_id::{AgentId, FrameworkId, OfferId, TaskId};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    ClusterDriver, DriverError, DriverEvent, FrameworkInfo, ResourceOffer, TaskSpec, TaskState,
    TaskStatusUpdate, EVENT_BUFFER,
};
use crate::resources::Resources;

const LOCAL_HOST: &str = "localhost";

/// Agent shape for autopilot mode.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub agent_resources: Resources,
    pub offer_interval: Duration,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            agent_resources: Resources::new().with("cpus", 4.0).with("mem", 4096.0),
            offer_interval: Duration::from_secs(1),
        }
    }
}

/// In-process manager. Clones share the same cluster.
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    subscribed: watch::Sender<bool>,
    autopilot: Option<LocalSettings>,
}

#[derive(Default)]
struct State {
    events: Option<mpsc::Sender<DriverEvent>>,
    framework: Option<FrameworkInfo>,
    framework_id: Option<FrameworkId>,
    accepted: Vec<OfferId>,
    launched: Vec<TaskSpec>,
    declined: Vec<OfferId>,
    stop_calls: usize,
    offer_seq: u64,
    agent: Option<AgentState>,
}

struct AgentState {
    free: Resources,
    outstanding: Option<OfferId>,
}

impl LocalCluster {
    /// A scripted cluster.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A cluster with one simulated agent that runs tasks locally.
    pub fn autopilot(settings: LocalSettings) -> Self {
        Self::build(Some(settings))
    }

    fn build(autopilot: Option<LocalSettings>) -> Self {
        let (subscribed, _) = watch::channel(false);
        let agent = autopilot.as_ref().map(|s| AgentState {
            free: s.agent_resources.clone(),
            outstanding: None,
        });
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    agent,
                    ..State::default()
                }),
                subscribed,
                autopilot,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// Waits until a framework has subscribed.
    pub async fn wait_subscribed(&self) {
        let mut rx = self.inner.subscribed.subscribe();
        let _ = rx.wait_for(|subscribed| *subscribed).await;
    }

    /// Acknowledges registration of the subscribed framework.
    pub async fn register(&self) -> FrameworkId {
        let framework_id = self.framework_id();
        self.emit(DriverEvent::Registered {
            framework_id: framework_id.clone(),
        })
        .await;
        framework_id
    }

    /// Sends one offer in its own round.
    pub async fn offer(&self, resources: Resources) -> OfferId {
        let mut ids = self.offer_batch(vec![resources]).await;
        ids.remove(0)
    }

    /// Sends several offers as a single round, in the given order.
    pub async fn offer_batch(&self, batch: Vec<Resources>) -> Vec<OfferId> {
        let offers: Vec<ResourceOffer> = batch
            .into_iter()
            .map(|resources| ResourceOffer {
                id: self.next_offer_id(),
                agent_id: local_agent(),
                hostname: LOCAL_HOST.to_string(),
                resources,
            })
            .collect();
        let ids = offers.iter().map(|o| o.id.clone()).collect();
        self.emit(DriverEvent::Offers(offers)).await;
        ids
    }

    /// Reports a task status.
    pub async fn update(&self, task_id: TaskId, state: TaskState) -> bool {
        self.emit(DriverEvent::Update(TaskStatusUpdate {
            task_id,
            state,
            message: None,
        }))
        .await
    }

    /// Reports a manager error.
    pub async fn error(&self, message: &str) -> bool {
        self.emit(DriverEvent::Error {
            message: message.to_string(),
        })
        .await
    }

    /// Drops the connection, announcing it.
    pub async fn disconnect(&self, reason: &str) {
        self.emit(DriverEvent::Disconnected {
            reason: reason.to_string(),
        })
        .await;
        self.close();
    }

    /// Drops the connection without any event.
    pub fn close(&self) {
        self.state().events = None;
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn framework(&self) -> Option<FrameworkInfo> {
        self.state().framework.clone()
    }

    /// Every task launched so far, in launch order.
    pub fn launched(&self) -> Vec<TaskSpec> {
        self.state().launched.clone()
    }

    /// Offers used by launches.
    pub fn accepted(&self) -> Vec<OfferId> {
        self.state().accepted.clone()
    }

    pub fn declined(&self) -> Vec<OfferId> {
        self.state().declined.clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.state().stop_calls
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn framework_id(&self) -> FrameworkId {
        self.state()
            .framework_id
            .get_or_insert_with(|| FrameworkId::with_prefix("local", relay_id::Ulid::new()))
            .clone()
    }

    fn next_offer_id(&self) -> OfferId {
        let mut state = self.state();
        state.offer_seq += 1;
        OfferId::with_prefix("local-offer", state.offer_seq)
    }

    /// Sends an event to the subscriber. Returns false if nobody listens.
    async fn emit(&self, event: DriverEvent) -> bool {
        let Some(tx) = self.state().events.clone() else {
            debug!(event = ?event, "No subscriber, dropping event");
            return false;
        };
        tx.send(event).await.is_ok()
    }

    fn release_offer(&self, offer_ids: &[OfferId]) {
        if let Some(agent) = self.state().agent.as_mut() {
            if agent
                .outstanding
                .as_ref()
                .is_some_and(|o| offer_ids.contains(o))
            {
                agent.outstanding = None;
            }
        }
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn local_agent() -> AgentId {
    AgentId::with_prefix("local", "agent")
}

#[async_trait]
impl ClusterDriver for LocalCluster {
    async fn subscribe(
        &self,
        framework: &FrameworkInfo,
    ) -> Result<mpsc::Receiver<DriverEvent>, DriverError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        {
            let mut state = self.state();
            state.events = Some(tx);
            state.framework = Some(framework.clone());
        }
        info!(framework = %framework.name, "Framework subscribed to local cluster");
        self.inner.subscribed.send_replace(true);

        if let Some(settings) = self.inner.autopilot.clone() {
            tokio::spawn(pilot(self.clone(), settings.offer_interval));
        }
        Ok(rx)
    }

    async fn launch(
        &self,
        offer_ids: &[OfferId],
        tasks: Vec<TaskSpec>,
    ) -> Result<(), DriverError> {
        {
            let mut state = self.state();
            state.accepted.extend_from_slice(offer_ids);
            state.launched.extend(tasks.iter().cloned());
            if let Some(agent) = state.agent.as_mut() {
                for task in &tasks {
                    agent.free.subtract(&task.resources);
                }
            }
        }
        self.release_offer(offer_ids);

        if self.inner.autopilot.is_some() {
            for task in tasks {
                tokio::spawn(run_task(self.clone(), task));
            }
        }
        Ok(())
    }

    async fn decline(&self, offer_ids: &[OfferId]) -> Result<(), DriverError> {
        self.state().declined.extend_from_slice(offer_ids);
        self.release_offer(offer_ids);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        let events = {
            let mut state = self.state();
            state.stop_calls += 1;
            state.events.take()
        };
        info!("Local cluster driver stopped");
        if let Some(tx) = events {
            let _ = tx.send(DriverEvent::Stopped).await;
        }
        Ok(())
    }
}

// =============================================================================
// Autopilot
// =============================================================================

async fn pilot(cluster: LocalCluster, offer_interval: Duration) {
    let framework_id = cluster.register().await;
    debug!(framework_id = %framework_id, "Local cluster registered framework");

    let mut interval = tokio::time::interval(offer_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let offer = {
            let mut guard = cluster.state();
            let state = &mut *guard;
            if state.events.is_none() {
                break;
            }
            let Some(agent) = state.agent.as_mut() else {
                break;
            };
            if agent.outstanding.is_some() {
                continue;
            }
            state.offer_seq += 1;
            let id = OfferId::with_prefix("local-offer", state.offer_seq);
            agent.outstanding = Some(id.clone());
            ResourceOffer {
                id,
                agent_id: local_agent(),
                hostname: LOCAL_HOST.to_string(),
                resources: agent.free.clone(),
            }
        };

        if !cluster.emit(DriverEvent::Offers(vec![offer])).await {
            break;
        }
    }
    debug!("Local cluster pilot exiting");
}

async fn run_task(cluster: LocalCluster, task: TaskSpec) {
    if let Some(image) = &task.image {
        debug!(task_id = %task.task_id, image = %image, "Local cluster ignores container images");
    }
    cluster.update(task.task_id, TaskState::Starting).await;

    let child = Command::new("sh")
        .arg("-c")
        .arg(&task.command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn();

    let (state, message) = match child {
        Ok(mut child) => {
            cluster.update(task.task_id, TaskState::Running).await;
            match child.wait().await {
                Ok(status) if status.success() => (TaskState::Finished, None),
                Ok(status) => (TaskState::Failed, Some(format!("command exited with {status}"))),
                Err(e) => (TaskState::Failed, Some(e.to_string())),
            }
        }
        Err(e) => (TaskState::Failed, Some(format!("failed to spawn: {e}"))),
    };

    if let Some(agent) = cluster.state().agent.as_mut() {
        agent.free.restore(&task.resources);
    }

    if let Some(message) = &message {
        warn!(task_id = %task.task_id, reason = %message, "Local task failed");
    }
    cluster
        .emit(DriverEvent::Update(TaskStatusUpdate {
            task_id: task.task_id,
            state,
            message,
        }))
        .await;
}
