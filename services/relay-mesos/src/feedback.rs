//! Feedback loop interface and the bundled metric loop.
//!
//! The control-loop unit treats the loop as opaque: it hands over the scale
//! callbacks and waits for it to fail. [`MetricLoop`] is the loop the binary
//! ships with: sample a metric command, compare against a target, and ask
//! for warmer or cooler tasks in proportion to the error.

use std::collections::VecDeque;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::control_loop::ScaleHandles;
use crate::shared::Direction;

/// A feedback loop producing scale requests.
///
/// `run` is expected to run forever. Returning at all, with or without an
/// error, ends the whole system.
#[async_trait]
pub trait FeedbackLoop: Send + 'static {
    async fn run(self, scale: ScaleHandles) -> Result<()>;
}

/// Adapts a closure into a [`FeedbackLoop`].
pub struct FnLoop<F>(F);

impl<F, Fut> FnLoop<F>
where
    F: FnOnce(ScaleHandles) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> FeedbackLoop for FnLoop<F>
where
    F: FnOnce(ScaleHandles) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(self, scale: ScaleHandles) -> Result<()> {
        (self.0)(scale).await
    }
}

// =============================================================================
// Metric loop
// =============================================================================

#[derive(Debug, Clone)]
pub struct FeedbackSettings {
    /// Shell command printing the current metric value.
    pub metric: String,
    pub target: f64,
    /// Time between samples.
    pub delay: Duration,
    /// Number of recent errors averaged per decision.
    pub lookback: usize,
    /// Tasks requested per unit of averaged error.
    pub gain: f64,
    /// Upper bound on one request's magnitude.
    pub max_tasks: u64,
}

pub struct MetricLoop {
    settings: FeedbackSettings,
}

impl MetricLoop {
    pub fn new(settings: FeedbackSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl FeedbackLoop for MetricLoop {
    async fn run(self, scale: ScaleHandles) -> Result<()> {
        let settings = self.settings;
        info!(
            metric = %settings.metric,
            target = settings.target,
            delay_ms = settings.delay.as_millis() as u64,
            lookback = settings.lookback,
            gain = settings.gain,
            "Starting metric loop"
        );

        let mut window = ErrorWindow::new(settings.lookback);
        let mut interval = tokio::time::interval(settings.delay);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let value = sample(&settings.metric).await?;
            let average = window.push(settings.target - value);
            let n = scale_decision(average, settings.gain, settings.max_tasks);
            debug!(value, average_error = average, n, "Metric sampled");

            let Some(direction) = Direction::of(n) else {
                continue;
            };
            match scale.get(direction) {
                Some(callback) => callback.call(n),
                None => debug!(direction = %direction, n, "No callback bound, skipping"),
            }
        }
    }
}

/// Rolling window of the most recent errors.
#[derive(Debug)]
struct ErrorWindow {
    errors: VecDeque<f64>,
    capacity: usize,
}

impl ErrorWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            errors: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds an error and returns the window's mean.
    fn push(&mut self, error: f64) -> f64 {
        if self.errors.len() == self.capacity {
            self.errors.pop_front();
        }
        self.errors.push_back(error);
        self.errors.iter().sum::<f64>() / self.errors.len() as f64
    }
}

/// Signed task count for an averaged error: positive asks for warmer tasks,
/// negative for cooler ones.
pub fn scale_decision(average_error: f64, gain: f64, max_tasks: u64) -> i64 {
    let raw = (average_error * gain).round();
    if !raw.is_finite() {
        return 0;
    }
    let limit = i64::try_from(max_tasks).unwrap_or(i64::MAX) as f64;
    raw.clamp(-limit, limit) as i64
}

/// Runs the metric command and parses its output as a number.
async fn sample(command: &str) -> Result<f64> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run metric command '{command}'"))?;

    if !output.status.success() {
        bail!(
            "metric command '{command}' exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let value: f64 = stdout
        .trim()
        .parse()
        .with_context(|| format!("metric command printed '{}', not a number", stdout.trim()))?;
    if !value.is_finite() {
        bail!("metric command printed non-finite value {value}");
    }
    Ok(value)
}
