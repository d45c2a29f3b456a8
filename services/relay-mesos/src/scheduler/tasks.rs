//! Task records and the template tasks are built from.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use relay_id::{AgentId, TaskId};

use crate::driver::{TaskSpec, TaskState};
use crate::resources::Resources;
use crate::shared::Direction;

/// Per-launch configuration, identical for every task of a direction.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTemplate {
    pub resources: Resources,
    pub image: Option<String>,
    pub warmer: Option<String>,
    pub cooler: Option<String>,
}

impl TaskTemplate {
    pub fn command(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Warmer => self.warmer.as_deref(),
            Direction::Cooler => self.cooler.as_deref(),
        }
    }

    /// Builds a fresh task for `direction`, or `None` if it has no command.
    pub fn build(&self, direction: Direction, agent_id: &AgentId) -> Option<TaskSpec> {
        let command = self.command(direction)?;
        Some(TaskSpec {
            task_id: TaskId::new(),
            name: format!("relay.{direction}"),
            direction,
            agent_id: agent_id.clone(),
            command: command.to_string(),
            resources: self.resources.clone(),
            image: self.image.clone(),
        })
    }
}

/// A launched task as the scheduler knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub direction: Direction,
    pub agent_id: AgentId,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn staged(spec: &TaskSpec) -> Self {
        Self {
            task_id: spec.task_id,
            direction: spec.direction,
            agent_id: spec.agent_id.clone(),
            state: TaskState::Staging,
            created_at: Utc::now(),
        }
    }
}

/// Active tasks keyed by id.
#[derive(Debug, Default)]
pub struct TaskTable {
    records: HashMap<TaskId, TaskRecord>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: TaskRecord) {
        self.records.insert(record.task_id, record);
    }

    /// Moves a task to `state`. Returns the previous state, or `None` if the
    /// task is unknown.
    pub fn transition(&mut self, task_id: &TaskId, state: TaskState) -> Option<TaskState> {
        let record = self.records.get_mut(task_id)?;
        Some(std::mem::replace(&mut record.state, state))
    }

    pub fn remove(&mut self, task_id: &TaskId) -> Option<TaskRecord> {
        self.records.remove(task_id)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&TaskRecord> {
        self.records.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of active tasks per direction.
    pub fn count(&self, direction: Direction) -> usize {
        self.records
            .values()
            .filter(|r| r.direction == direction)
            .count()
    }
}
