//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use relay_mesos::driver::FrameworkInfo;
use relay_mesos::scheduler::{SchedulerSettings, TaskTemplate};
use relay_mesos::supervisor::SupervisorSettings;

pub fn framework() -> FrameworkInfo {
    FrameworkInfo {
        name: "relay-test".to_string(),
        user: String::new(),
        principal: None,
        role: "*".to_string(),
    }
}

/// One cpu per task, both directions configured.
pub fn scheduler_settings(max_failures: i64) -> SchedulerSettings {
    SchedulerSettings {
        framework: framework(),
        task: TaskTemplate {
            resources: "cpus=1 mem=64".parse().unwrap(),
            image: None,
            warmer: Some("echo warm".to_string()),
            cooler: Some("echo cool".to_string()),
        },
        max_failures,
    }
}

pub fn supervisor_settings() -> SupervisorSettings {
    SupervisorSettings {
        monitor_interval: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(500),
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}
