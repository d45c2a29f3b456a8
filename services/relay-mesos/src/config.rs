//! Configuration: command line flags with environment fallbacks.
//!
//! [`Cli`] is the raw clap surface. [`Config::try_from`] validates it and
//! splits it into the settings each part of the system consumes.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::driver::{FrameworkInfo, LocalSettings};
use crate::feedback::FeedbackSettings;
use crate::resources::{ResourceParseError, Resources};
use crate::scheduler::{SchedulerSettings, TaskTemplate};
use crate::supervisor::SupervisorSettings;

pub const DEFAULT_FRAMEWORK_NAME: &str = "Relay.Mesos Framework";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Bridges a feedback control loop to a Mesos cluster.
///
/// The loop samples a metric and compares it to a target. When the metric
/// is too low, warmer tasks are launched; when too high, cooler tasks.
#[derive(Debug, Clone, Parser)]
#[command(name = "relay-mesos", version, about)]
pub struct Cli {
    /// Cluster manager endpoint: http(s)://host:port for a Mesos master, or
    /// local:// for the in-process cluster.
    #[arg(long, env = "RELAY_MESOS_MASTER")]
    pub mesos_master: Option<String>,

    /// Shell command run by warmer tasks.
    #[arg(long, env = "RELAY_WARMER")]
    pub warmer: Option<String>,

    /// Shell command run by cooler tasks.
    #[arg(long, env = "RELAY_COOLER")]
    pub cooler: Option<String>,

    /// Resources each task requires, e.g. "cpus=0.5 mem=256".
    #[arg(long, env = "RELAY_TASK_RESOURCES", default_value = "")]
    pub task_resources: String,

    /// Container image tasks run in.
    #[arg(long, env = "RELAY_DOCKER_IMAGE")]
    pub docker_image: Option<String>,

    /// Failure breaker threshold. Negative disables the breaker.
    #[arg(long, env = "RELAY_MAX_FAILURES", default_value_t = -1, allow_negative_numbers = true)]
    pub max_failures: i64,

    #[arg(long, env = "RELAY_FRAMEWORK_NAME", default_value = DEFAULT_FRAMEWORK_NAME)]
    pub framework_name: String,

    #[arg(long, env = "RELAY_FRAMEWORK_PRINCIPAL")]
    pub framework_principal: Option<String>,

    #[arg(long, env = "RELAY_FRAMEWORK_ROLE", default_value = "*")]
    pub framework_role: String,

    /// User tasks run as. Empty lets the agent decide.
    #[arg(long, env = "RELAY_FRAMEWORK_USER", default_value = "")]
    pub framework_user: String,

    /// Shell command printing the current metric value.
    #[arg(long, env = "RELAY_METRIC")]
    pub metric: Option<String>,

    /// Target value for the metric.
    #[arg(long, env = "RELAY_TARGET", allow_negative_numbers = true)]
    pub target: Option<f64>,

    /// Seconds between metric samples.
    #[arg(long, env = "RELAY_DELAY", default_value_t = 1.0)]
    pub delay: f64,

    /// Number of samples averaged per decision.
    #[arg(long, env = "RELAY_LOOKBACK", default_value_t = 1)]
    pub lookback: usize,

    /// Tasks requested per unit of averaged error.
    #[arg(long, env = "RELAY_GAIN", default_value_t = 1.0)]
    pub gain: f64,

    /// Largest number of tasks one request may ask for.
    #[arg(long, env = "RELAY_MAX_TASKS", default_value_t = 100)]
    pub max_tasks: u64,

    /// Resources of the simulated agent when using local://.
    #[arg(long, env = "RELAY_LOCAL_AGENT_RESOURCES", default_value = "cpus=4 mem=4096")]
    pub local_agent_resources: String,

    /// Offer period of the simulated agent when using local://.
    #[arg(long, env = "RELAY_LOCAL_OFFER_INTERVAL_MS", default_value_t = 1000)]
    pub local_offer_interval_ms: u64,

    #[arg(long, env = "RELAY_MONITOR_INTERVAL_MS", default_value_t = 100)]
    pub monitor_interval_ms: u64,

    #[arg(long, env = "RELAY_SHUTDOWN_GRACE_MS", default_value_t = 2000)]
    pub shutdown_grace_ms: u64,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "RELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("a cluster manager endpoint is required (--mesos-master or RELAY_MESOS_MASTER)")]
    MissingMaster,

    #[error("at least one of --warmer or --cooler is required")]
    NoCommands,

    #[error("a metric command is required (--metric or RELAY_METRIC)")]
    MissingMetric,

    #[error("a finite metric target is required (--target or RELAY_TARGET)")]
    MissingTarget,

    #[error("invalid {flag}: {source}")]
    Resources {
        flag: &'static str,
        source: ResourceParseError,
    },

    #[error("invalid {flag}: {reason}")]
    Invalid { flag: &'static str, reason: String },
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    pub scheduler: SchedulerSettings,
    pub feedback: FeedbackSettings,
    pub supervisor: SupervisorSettings,
    pub local: LocalSettings,
}

impl TryFrom<Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let endpoint = non_empty(cli.mesos_master).ok_or(ConfigError::MissingMaster)?;

        let warmer = non_empty(cli.warmer);
        let cooler = non_empty(cli.cooler);
        if warmer.is_none() && cooler.is_none() {
            return Err(ConfigError::NoCommands);
        }

        let metric = non_empty(cli.metric).ok_or(ConfigError::MissingMetric)?;
        let target = cli
            .target
            .filter(|t| t.is_finite())
            .ok_or(ConfigError::MissingTarget)?;

        let resources = parse_resources("--task-resources", &cli.task_resources)?;
        let agent_resources =
            parse_resources("--local-agent-resources", &cli.local_agent_resources)?;

        let delay = Duration::try_from_secs_f64(cli.delay)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| invalid("--delay", "must be a positive number of seconds"))?;
        if cli.lookback == 0 {
            return Err(invalid("--lookback", "must be at least 1"));
        }
        if !cli.gain.is_finite() {
            return Err(invalid("--gain", "must be finite"));
        }
        if cli.max_tasks == 0 {
            return Err(invalid("--max-tasks", "must be at least 1"));
        }
        if cli.monitor_interval_ms == 0 {
            return Err(invalid("--monitor-interval-ms", "must be at least 1"));
        }
        if cli.local_offer_interval_ms == 0 {
            return Err(invalid("--local-offer-interval-ms", "must be at least 1"));
        }

        Ok(Self {
            endpoint,
            scheduler: SchedulerSettings {
                framework: FrameworkInfo {
                    name: cli.framework_name,
                    user: cli.framework_user,
                    principal: non_empty(cli.framework_principal),
                    role: cli.framework_role,
                },
                task: TaskTemplate {
                    resources,
                    image: non_empty(cli.docker_image),
                    warmer,
                    cooler,
                },
                max_failures: cli.max_failures,
            },
            feedback: FeedbackSettings {
                metric,
                target,
                delay,
                lookback: cli.lookback,
                gain: cli.gain,
                max_tasks: cli.max_tasks,
            },
            supervisor: SupervisorSettings {
                monitor_interval: Duration::from_millis(cli.monitor_interval_ms),
                shutdown_grace: Duration::from_millis(cli.shutdown_grace_ms),
            },
            local: LocalSettings {
                agent_resources,
                offer_interval: Duration::from_millis(cli.local_offer_interval_ms),
            },
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_resources(flag: &'static str, value: &str) -> Result<Resources, ConfigError> {
    value
        .parse()
        .map_err(|source| ConfigError::Resources { flag, source })
}

fn invalid(flag: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        flag,
        reason: reason.to_string(),
    }
}
