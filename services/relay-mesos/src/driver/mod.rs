//! Cluster manager protocol.
//!
//! The scheduler talks to a resource-offer cluster manager only through the
//! [`ClusterDriver`] trait. Two bindings exist:
//!
//! - [`MesosDriver`]: the Mesos v1 scheduler HTTP API (`http://` / `https://`)
//! - [`LocalCluster`]: an in-process manager (`local://`), scriptable from
//!   tests and able to run tasks on the local host
//!
//! Events flow from the driver to the scheduler over an mpsc channel
//! returned by [`ClusterDriver::subscribe`]. Calls flow the other way as
//! plain async methods.

pub mod local;
pub mod mesos;
pub mod recordio;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use relay_id::{AgentId, FrameworkId, OfferId, TaskId};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::resources::Resources;
use crate::shared::Direction;

pub use local::{LocalCluster, LocalSettings};
pub use mesos::MesosDriver;

/// Capacity of the driver → scheduler event channel.
pub const EVENT_BUFFER: usize = 256;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum DriverError {
    /// No binding exists for the endpoint, or it could not be constructed.
    #[error("cluster manager binding unavailable: {0}")]
    Unavailable(String),

    #[error("not subscribed to the cluster manager")]
    NotSubscribed,

    #[error("cluster manager rejected {call}: HTTP {status}: {body}")]
    Rejected {
        call: &'static str,
        status: u16,
        body: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed message from cluster manager: {0}")]
    Protocol(String),
}

// =============================================================================
// Protocol types
// =============================================================================

/// What the framework registers as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkInfo {
    pub name: String,
    pub user: String,
    pub principal: Option<String>,
    pub role: String,
}

/// Resources currently available on one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceOffer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub resources: Resources,
}

/// One task to launch against an offer.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub name: String,
    pub direction: Direction,
    pub agent_id: AgentId,
    /// Shell command the task runs.
    pub command: String,
    pub resources: Resources,
    pub image: Option<String>,
}

/// Task lifecycle states reported by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Lost,
    Killed,
}

impl TaskState {
    /// Terminal states end a task's life; no further updates follow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::Lost | Self::Killed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Lost => "lost",
            Self::Killed => "killed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusUpdate {
    pub task_id: TaskId,
    pub state: TaskState,
    pub message: Option<String>,
}

/// Everything the manager can tell the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// Registration acknowledged.
    Registered { framework_id: FrameworkId },
    /// A batch of offers for one offer round.
    Offers(Vec<ResourceOffer>),
    /// An offer previously sent is no longer valid.
    Rescinded(OfferId),
    Update(TaskStatusUpdate),
    /// The manager reported an error; the framework is being removed.
    Error { message: String },
    /// The connection dropped without a stop being requested.
    Disconnected { reason: String },
    /// The driver stopped after `stop()` was called.
    Stopped,
}

// =============================================================================
// Driver trait
// =============================================================================

/// A connection to a resource-offer cluster manager.
///
/// Dropping the event receiver's sender without sending `Stopped` counts as
/// an abnormal disconnection.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Registers the framework and returns the event stream.
    async fn subscribe(
        &self,
        framework: &FrameworkInfo,
    ) -> Result<mpsc::Receiver<DriverEvent>, DriverError>;

    /// Launches tasks using the given offers.
    async fn launch(&self, offer_ids: &[OfferId], tasks: Vec<TaskSpec>)
        -> Result<(), DriverError>;

    /// Returns offers unused.
    async fn decline(&self, offer_ids: &[OfferId]) -> Result<(), DriverError>;

    /// Ends the session with the manager.
    async fn stop(&self) -> Result<(), DriverError>;
}

/// Builds the driver inside the scheduler unit.
pub type Connector = Box<dyn FnOnce() -> Result<Arc<dyn ClusterDriver>, DriverError> + Send>;

/// Binds to the manager named by `endpoint`.
///
/// This is the capability check: an endpoint without a binding, or a
/// binding that cannot be constructed, fails here with a descriptive error.
pub fn connect(
    endpoint: &str,
    local: &LocalSettings,
) -> Result<Arc<dyn ClusterDriver>, DriverError> {
    let scheme = endpoint
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| {
            DriverError::Unavailable(format!("endpoint '{endpoint}' has no scheme"))
        })?;

    match scheme.as_str() {
        "http" | "https" => Ok(Arc::new(MesosDriver::connect(endpoint)?)),
        "local" => Ok(Arc::new(LocalCluster::autopilot(local.clone()))),
        other => Err(DriverError::Unavailable(format!(
            "no binding for '{other}://' endpoints (supported: http, https, local)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("zk://zk1:2181/mesos")]
    #[case("master:5050")]
    #[case("ftp://master")]
    fn test_connect_unavailable(#[case] endpoint: &str) {
        let err = connect(endpoint, &LocalSettings::default()).err().unwrap();
        assert!(matches!(err, DriverError::Unavailable(_)), "{err}");
    }

    #[tokio::test]
    async fn test_connect_bindings() {
        assert!(connect("http://127.0.0.1:5050", &LocalSettings::default()).is_ok());
        assert!(connect("HTTPS://mesos.example.com", &LocalSettings::default()).is_ok());
        assert!(connect("local://", &LocalSettings::default()).is_ok());
    }

    #[rstest]
    #[case(TaskState::Staging, false)]
    #[case(TaskState::Starting, false)]
    #[case(TaskState::Running, false)]
    #[case(TaskState::Finished, true)]
    #[case(TaskState::Failed, true)]
    #[case(TaskState::Lost, true)]
    #[case(TaskState::Killed, true)]
    fn test_terminal_states(#[case] state: TaskState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }
}
