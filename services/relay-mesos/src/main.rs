//! Relay.Mesos
//!
//! Runs a metric feedback loop and a Mesos scheduler side by side. The
//! process exits 0 when the cluster manager acknowledges a clean stop and 1
//! on any fault, including configuration errors and termination signals.

use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use colored::Colorize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use relay_mesos::config::{Cli, Config, LogFormat};
use relay_mesos::driver::{self, Connector};
use relay_mesos::feedback::MetricLoop;
use relay_mesos::supervisor::{termination_signal, Supervisor};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
        // --help and --version
        Err(e) => e.exit(),
    };

    init_tracing(&cli.log_level, cli.log_format);

    let config = match Config::try_from(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            eprintln!("\n{}", Cli::command().render_usage());
            return ExitCode::FAILURE;
        }
    };

    info!(
        endpoint = %config.endpoint,
        framework = %config.scheduler.framework.name,
        task_resources = %config.scheduler.task.resources,
        max_failures = config.scheduler.max_failures,
        "Starting relay-mesos"
    );

    let endpoint = config.endpoint.clone();
    let local = config.local.clone();
    let connector: Connector = Box::new(move || driver::connect(&endpoint, &local));

    let outcome = Supervisor::new(config.supervisor)
        .run(
            MetricLoop::new(config.feedback),
            connector,
            config.scheduler,
            termination_signal(),
        )
        .await;

    ExitCode::from(outcome.exit_code())
}

fn init_tracing(default_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());
    let fmt = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };
    tracing_subscriber::registry().with(filter).with(fmt).init();
}
