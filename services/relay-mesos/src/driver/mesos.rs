//! Mesos v1 scheduler HTTP API binding.
//!
//! ## Protocol
//!
//! ```text
//! POST {master}/api/v1/scheduler  SUBSCRIBE ──▶ 200, Mesos-Stream-Id: <id>
//!                                              RecordIO event stream:
//!                                              SUBSCRIBED, OFFERS, UPDATE, ...
//! POST {master}/api/v1/scheduler  ACCEPT / DECLINE / ACKNOWLEDGE / TEARDOWN
//!      (Mesos-Stream-Id header)   ──▶ 202
//! ```
//!
//! A background task reads the event stream, acknowledges status updates
//! that carry a uuid, and forwards translated events to the scheduler.
//!
//! ## Stop semantics
//!
//! The stream only ends as [`DriverEvent::Stopped`] after this process has
//! called [`ClusterDriver::stop`]; any other end of stream is a
//! disconnect. Against a real master a clean, exit-0 stop is therefore never
//! observed: the scheduler calls `stop` only on its breaker and shutdown
//! paths, after it has stopped reading events. A master-side removal of the
//! framework arrives as an `ERROR` event and is a fault.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use relay_id::{AgentId, FrameworkId, OfferId, TaskId};
use reqwest::header::ACCEPT;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::recordio::RecordIoDecoder;
use super::{
    ClusterDriver, DriverError, DriverEvent, FrameworkInfo, ResourceOffer, TaskSpec, TaskState,
    TaskStatusUpdate, EVENT_BUFFER,
};
use crate::resources::Resources;

const STREAM_ID_HEADER: &str = "Mesos-Stream-Id";
const SCHEDULER_PATH: &str = "api/v1/scheduler";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a declined offer is withheld from this framework.
const DECLINE_REFUSE_SECONDS: f64 = 5.0;

// =============================================================================
// Driver
// =============================================================================

pub struct MesosDriver {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    url: Url,
    session: Mutex<Session>,
    stopping: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct Session {
    stream_id: Option<String>,
    framework_id: Option<FrameworkId>,
}

impl MesosDriver {
    /// Validates the master URL and builds the HTTP client.
    pub fn connect(endpoint: &str) -> Result<Self, DriverError> {
        let base = Url::parse(endpoint).map_err(|e| {
            DriverError::Unavailable(format!("invalid Mesos master URL '{endpoint}': {e}"))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(DriverError::Unavailable(format!(
                "Mesos master URL must be http or https, got '{}'",
                base.scheme()
            )));
        }
        let url = scheduler_url(base)?;

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| DriverError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                url,
                session: Mutex::new(Session::default()),
                stopping: AtomicBool::new(false),
                reader: Mutex::new(None),
            }),
        })
    }

    /// The scheduler API URL calls are posted to.
    pub fn url(&self) -> &Url {
        &self.inner.url
    }
}

impl Drop for MesosDriver {
    fn drop(&mut self) {
        if let Some(reader) = self.inner.reader().take() {
            reader.abort();
        }
    }
}

fn scheduler_url(mut base: Url) -> Result<Url, DriverError> {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(SCHEDULER_PATH)
        .map_err(|e| DriverError::Unavailable(format!("invalid Mesos master URL: {e}")))
}

#[async_trait]
impl ClusterDriver for MesosDriver {
    async fn subscribe(
        &self,
        framework: &FrameworkInfo,
    ) -> Result<mpsc::Receiver<DriverEvent>, DriverError> {
        let body = json!({
            "type": "SUBSCRIBE",
            "subscribe": { "framework_info": framework_info(framework) },
        });

        info!(
            url = %self.inner.url,
            framework = %framework.name,
            "Subscribing to Mesos master"
        );

        let response = self
            .inner
            .client
            .post(self.inner.url.clone())
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Rejected {
                call: "SUBSCRIBE",
                status: status.as_u16(),
                body,
            });
        }

        let stream_id = response
            .headers()
            .get(STREAM_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                DriverError::Protocol(format!("SUBSCRIBE response missing {STREAM_ID_HEADER}"))
            })?;
        debug!(stream_id = %stream_id, "Mesos event stream opened");
        self.inner.session().stream_id = Some(stream_id);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(read_events(Arc::clone(&self.inner), response, tx));
        *self.inner.reader() = Some(reader);

        Ok(rx)
    }

    async fn launch(
        &self,
        offer_ids: &[OfferId],
        tasks: Vec<TaskSpec>,
    ) -> Result<(), DriverError> {
        let framework_id = self.inner.framework_id()?;
        let task_infos: Vec<Value> = tasks.iter().map(task_info).collect();

        debug!(
            offers = offer_ids.len(),
            tasks = task_infos.len(),
            "Accepting offers"
        );

        self.inner
            .call(
                "ACCEPT",
                json!({
                    "framework_id": { "value": framework_id.as_str() },
                    "type": "ACCEPT",
                    "accept": {
                        "offer_ids": id_values(offer_ids),
                        "operations": [{
                            "type": "LAUNCH",
                            "launch": { "task_infos": task_infos },
                        }],
                    },
                }),
            )
            .await
    }

    async fn decline(&self, offer_ids: &[OfferId]) -> Result<(), DriverError> {
        let framework_id = self.inner.framework_id()?;
        self.inner
            .call(
                "DECLINE",
                json!({
                    "framework_id": { "value": framework_id.as_str() },
                    "type": "DECLINE",
                    "decline": {
                        "offer_ids": id_values(offer_ids),
                        "filters": { "refuse_seconds": DECLINE_REFUSE_SECONDS },
                    },
                }),
            )
            .await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let framework_id = self.inner.session().framework_id.clone();
        let result = match framework_id {
            Some(id) => {
                info!(framework_id = %id, "Tearing down framework");
                self.inner
                    .call(
                        "TEARDOWN",
                        json!({
                            "framework_id": { "value": id.as_str() },
                            "type": "TEARDOWN",
                        }),
                    )
                    .await
            }
            None => Ok(()),
        };

        // On success the master closes the stream and the reader reports
        // `Stopped`. Otherwise nothing will close it for us.
        if result.is_err() || self.inner.session().framework_id.is_none() {
            if let Some(reader) = self.inner.reader().take() {
                reader.abort();
            }
        }
        result
    }
}

// =============================================================================
// Calls
// =============================================================================

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reader(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn framework_id(&self) -> Result<FrameworkId, DriverError> {
        self.session()
            .framework_id
            .clone()
            .ok_or(DriverError::NotSubscribed)
    }

    async fn call(&self, call: &'static str, body: Value) -> Result<(), DriverError> {
        let stream_id = self
            .session()
            .stream_id
            .clone()
            .ok_or(DriverError::NotSubscribed)?;

        debug!(call, "Sending Mesos call");

        let response = self
            .client
            .post(self.url.clone())
            .header(STREAM_ID_HEADER, stream_id)
            .timeout(CALL_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Rejected {
                call,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn acknowledge(&self, status: &Status, uuid: &str) {
        let Ok(framework_id) = self.framework_id() else {
            warn!(task_id = %status.task_id.value, "Cannot acknowledge update before subscription");
            return;
        };
        let Some(agent_id) = &status.agent_id else {
            debug!(task_id = %status.task_id.value, "Update without agent, not acknowledging");
            return;
        };

        let body = json!({
            "framework_id": { "value": framework_id.as_str() },
            "type": "ACKNOWLEDGE",
            "acknowledge": {
                "agent_id": { "value": agent_id.value },
                "task_id": { "value": status.task_id.value },
                "uuid": uuid,
            },
        });
        if let Err(e) = self.call("ACKNOWLEDGE", body).await {
            warn!(
                task_id = %status.task_id.value,
                error = %e,
                "Failed to acknowledge status update"
            );
        }
    }
}

fn framework_info(framework: &FrameworkInfo) -> Value {
    let mut info = json!({
        "user": framework.user,
        "name": framework.name,
        "role": framework.role,
    });
    if let Some(principal) = &framework.principal {
        info["principal"] = json!(principal);
    }
    info
}

fn task_info(task: &TaskSpec) -> Value {
    let resources: Vec<Value> = task
        .resources
        .iter()
        .map(|(name, quantity)| {
            json!({ "name": name, "type": "SCALAR", "scalar": { "value": quantity } })
        })
        .collect();

    let mut info = json!({
        "name": task.name,
        "task_id": { "value": task.task_id.to_string() },
        "agent_id": { "value": task.agent_id.as_str() },
        "resources": resources,
        "command": { "value": task.command, "shell": true },
    });
    if let Some(image) = &task.image {
        info["container"] = json!({ "type": "DOCKER", "docker": { "image": image } });
    }
    info
}

fn id_values(ids: &[OfferId]) -> Vec<Value> {
    ids.iter().map(|id| json!({ "value": id.as_str() })).collect()
}

// =============================================================================
// Event stream
// =============================================================================

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    kind: String,
    subscribed: Option<Subscribed>,
    offers: Option<Offers>,
    rescind: Option<Rescind>,
    update: Option<Update>,
    error: Option<ErrorEvent>,
}

#[derive(Debug, Deserialize)]
struct IdValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct Subscribed {
    framework_id: IdValue,
    heartbeat_interval_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Offers {
    #[serde(default)]
    offers: Vec<Offer>,
}

#[derive(Debug, Deserialize)]
struct Offer {
    id: IdValue,
    agent_id: IdValue,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    resources: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    name: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    scalar: Option<Scalar>,
}

#[derive(Debug, Deserialize)]
struct Scalar {
    value: f64,
}

#[derive(Debug, Deserialize)]
struct Rescind {
    offer_id: IdValue,
}

#[derive(Debug, Deserialize)]
struct Update {
    status: Status,
}

#[derive(Debug, Deserialize)]
struct Status {
    task_id: IdValue,
    state: String,
    agent_id: Option<IdValue>,
    uuid: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    message: String,
}

async fn read_events(inner: Arc<Inner>, response: reqwest::Response, tx: mpsc::Sender<DriverEvent>) {
    let reason = match pump(&inner, response, &tx).await {
        Ok(()) => "event stream ended".to_string(),
        Err(e) => e.to_string(),
    };

    let event = if inner.stopping.load(Ordering::SeqCst) {
        info!("Mesos event stream closed after stop");
        DriverEvent::Stopped
    } else {
        warn!(reason = %reason, "Mesos event stream dropped");
        DriverEvent::Disconnected { reason }
    };
    let _ = tx.send(event).await;
}

async fn pump(
    inner: &Inner,
    response: reqwest::Response,
    tx: &mpsc::Sender<DriverEvent>,
) -> Result<(), DriverError> {
    let mut body = response.bytes_stream();
    let mut decoder = RecordIoDecoder::new();

    while let Some(chunk) = body.next().await {
        decoder.push(&chunk?);
        while let Some(record) = decoder
            .next_record()
            .map_err(|e| DriverError::Protocol(e.to_string()))?
        {
            let event: Event = serde_json::from_slice(&record)
                .map_err(|e| DriverError::Protocol(format!("undecodable event: {e}")))?;
            if let Some(event) = inner.translate(event).await? {
                if tx.send(event).await.is_err() {
                    debug!("Event receiver dropped, closing Mesos stream");
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

fn missing(section: &str) -> DriverError {
    DriverError::Protocol(format!("event is missing its '{section}' section"))
}

impl Inner {
    async fn translate(&self, event: Event) -> Result<Option<DriverEvent>, DriverError> {
        match event.kind.as_str() {
            "SUBSCRIBED" => {
                let subscribed = event.subscribed.ok_or_else(|| missing("subscribed"))?;
                let framework_id = FrameworkId::parse(subscribed.framework_id.value)
                    .map_err(|e| DriverError::Protocol(format!("framework id: {e}")))?;
                info!(
                    framework_id = %framework_id,
                    heartbeat_interval_secs = ?subscribed.heartbeat_interval_seconds,
                    "Subscribed to Mesos master"
                );
                self.session().framework_id = Some(framework_id.clone());
                Ok(Some(DriverEvent::Registered { framework_id }))
            }
            "OFFERS" => {
                let offers = event.offers.ok_or_else(|| missing("offers"))?;
                let offers = offers
                    .offers
                    .into_iter()
                    .map(convert_offer)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(DriverEvent::Offers(offers)))
            }
            "RESCIND" => {
                let rescind = event.rescind.ok_or_else(|| missing("rescind"))?;
                let offer_id = OfferId::parse(rescind.offer_id.value)
                    .map_err(|e| DriverError::Protocol(format!("offer id: {e}")))?;
                Ok(Some(DriverEvent::Rescinded(offer_id)))
            }
            "UPDATE" => {
                let status = event.update.ok_or_else(|| missing("update"))?.status;
                if let Some(uuid) = &status.uuid {
                    self.acknowledge(&status, uuid).await;
                }
                Ok(convert_status(status).map(DriverEvent::Update))
            }
            "ERROR" => {
                let error = event.error.ok_or_else(|| missing("error"))?;
                Ok(Some(DriverEvent::Error {
                    message: error.message,
                }))
            }
            "HEARTBEAT" => {
                debug!("Mesos heartbeat");
                Ok(None)
            }
            "FAILURE" => {
                warn!("Mesos reported an agent or executor failure");
                Ok(None)
            }
            other => {
                debug!(kind = other, "Ignoring Mesos event");
                Ok(None)
            }
        }
    }
}

fn convert_offer(offer: Offer) -> Result<ResourceOffer, DriverError> {
    let id = OfferId::parse(offer.id.value)
        .map_err(|e| DriverError::Protocol(format!("offer id: {e}")))?;
    let agent_id = AgentId::parse(offer.agent_id.value)
        .map_err(|e| DriverError::Protocol(format!("agent id: {e}")))?;

    let mut resources = Resources::new();
    for resource in offer.resources {
        match (resource.kind.as_deref(), resource.scalar) {
            (Some("SCALAR"), Some(scalar)) => resources.add(&resource.name, scalar.value),
            _ => debug!(resource = %resource.name, "Skipping non-scalar resource"),
        }
    }

    Ok(ResourceOffer {
        id,
        agent_id,
        hostname: offer.hostname,
        resources,
    })
}

fn convert_status(status: Status) -> Option<TaskStatusUpdate> {
    let Some(state) = task_state(&status.state) else {
        debug!(
            task_id = %status.task_id.value,
            state = %status.state,
            "Ignoring non-actionable task state"
        );
        return None;
    };
    let task_id = match status.task_id.value.parse::<TaskId>() {
        Ok(id) => id,
        Err(e) => {
            warn!(
                task_id = %status.task_id.value,
                error = %e,
                "Ignoring update for a task this framework did not launch"
            );
            return None;
        }
    };
    Some(TaskStatusUpdate {
        task_id,
        state,
        message: status.message,
    })
}

/// Maps a Mesos `TaskState` name. `TASK_KILLING` and unknown names map to
/// `None`.
pub fn task_state(name: &str) -> Option<TaskState> {
    let state = match name {
        "TASK_STAGING" => TaskState::Staging,
        "TASK_STARTING" => TaskState::Starting,
        "TASK_RUNNING" => TaskState::Running,
        "TASK_FINISHED" => TaskState::Finished,
        "TASK_FAILED" | "TASK_ERROR" => TaskState::Failed,
        "TASK_LOST" | "TASK_DROPPED" | "TASK_UNREACHABLE" | "TASK_GONE"
        | "TASK_GONE_BY_OPERATOR" | "TASK_UNKNOWN" => TaskState::Lost,
        "TASK_KILLED" => TaskState::Killed,
        _ => return None,
    };
    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::Direction;
    use rstest::rstest;

    #[rstest]
    #[case("TASK_STAGING", Some(TaskState::Staging))]
    #[case("TASK_RUNNING", Some(TaskState::Running))]
    #[case("TASK_FINISHED", Some(TaskState::Finished))]
    #[case("TASK_FAILED", Some(TaskState::Failed))]
    #[case("TASK_ERROR", Some(TaskState::Failed))]
    #[case("TASK_LOST", Some(TaskState::Lost))]
    #[case("TASK_UNREACHABLE", Some(TaskState::Lost))]
    #[case("TASK_GONE", Some(TaskState::Lost))]
    #[case("TASK_KILLED", Some(TaskState::Killed))]
    #[case("TASK_KILLING", None)]
    #[case("TASK_SOMETHING_NEW", None)]
    fn test_task_state_mapping(#[case] name: &str, #[case] expected: Option<TaskState>) {
        assert_eq!(task_state(name), expected);
    }

    #[rstest]
    #[case("http://master:5050", "http://master:5050/api/v1/scheduler")]
    #[case("http://master:5050/", "http://master:5050/api/v1/scheduler")]
    #[case("https://lb.example.com/mesos", "https://lb.example.com/mesos/api/v1/scheduler")]
    fn test_scheduler_url(#[case] endpoint: &str, #[case] expected: &str) {
        let driver = MesosDriver::connect(endpoint).unwrap();
        assert_eq!(driver.url().as_str(), expected);
    }

    #[test]
    fn test_connect_rejects_garbage() {
        assert!(matches!(
            MesosDriver::connect("http://"),
            Err(DriverError::Unavailable(_))
        ));
    }

    #[test]
    fn test_offer_conversion_keeps_scalars() {
        let offer: Offer = serde_json::from_value(json!({
            "id": { "value": "o-1" },
            "agent_id": { "value": "a-1" },
            "hostname": "host-1",
            "resources": [
                { "name": "cpus", "type": "SCALAR", "scalar": { "value": 2.0 } },
                { "name": "mem", "type": "SCALAR", "scalar": { "value": 512.0 } },
                { "name": "ports", "type": "RANGES", "ranges": { "range": [] } }
            ]
        }))
        .unwrap();

        let offer = convert_offer(offer).unwrap();
        assert_eq!(offer.id.as_str(), "o-1");
        assert_eq!(offer.hostname, "host-1");
        assert_eq!(offer.resources, "cpus=2 mem=512".parse().unwrap());
    }

    #[test]
    fn test_foreign_task_update_ignored() {
        let status = Status {
            task_id: IdValue {
                value: "someone-elses-task".into(),
            },
            state: "TASK_FAILED".into(),
            agent_id: None,
            uuid: None,
            message: None,
        };
        assert_eq!(convert_status(status), None);
    }

    #[test]
    fn test_task_info_with_image() {
        let task = TaskSpec {
            task_id: TaskId::new(),
            name: "relay.warmer".into(),
            direction: Direction::Warmer,
            agent_id: AgentId::parse("a-1").unwrap(),
            command: "echo warm".into(),
            resources: "cpus=1".parse().unwrap(),
            image: Some("busybox:1.36".into()),
        };

        let info = task_info(&task);
        assert_eq!(info["command"]["value"], "echo warm");
        assert_eq!(info["command"]["shell"], true);
        assert_eq!(info["container"]["docker"]["image"], "busybox:1.36");
        assert_eq!(info["resources"][0]["scalar"]["value"], 1.0);
        assert_eq!(info["task_id"]["value"], task.task_id.to_string());
    }

    #[test]
    fn test_task_info_without_image() {
        let task = TaskSpec {
            task_id: TaskId::new(),
            name: "relay.cooler".into(),
            direction: Direction::Cooler,
            agent_id: AgentId::parse("a-1").unwrap(),
            command: "echo cool".into(),
            resources: Resources::new(),
            image: None,
        };
        assert!(task_info(&task).get("container").is_none());
    }
}
