//! Durable task state and its status machine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TaskConfig;
use crate::error::ConfigError;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The coordinator is actively driving the task.
    Running,
    /// The task was stopped (or checkpointed) with units outstanding.
    Paused,
    /// Every unit drained. Terminal; completed records are deleted from the
    /// store rather than kept.
    Completed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // Stop
            (Running, Paused) |
            // Resume (always under a new task id)
            (Paused, Running) |
            // Terminal
            (Running, Completed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Concurrency strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Units run one at a time, items within a unit in parallel.
    FillMode,
    /// Items from all units flattened into one parallel batch.
    DurationMode,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FillMode => "fill_mode",
            Self::DurationMode => "duration_mode",
        };
        write!(f, "{s}")
    }
}

/// Identifier bundle for the remote side of a task. Opaque to the engine
/// beyond a non-emptiness check; the executor collaborator interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTarget {
    pub course_id: String,
    pub account_id: String,
    pub class_id: String,
}

impl TaskTarget {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.course_id.is_empty() {
            return Err(ConfigError::MissingTarget { field: "course_id" });
        }
        if self.account_id.is_empty() {
            return Err(ConfigError::MissingTarget { field: "account_id" });
        }
        if self.class_id.is_empty() {
            return Err(ConfigError::MissingTarget { field: "class_id" });
        }
        Ok(())
    }
}

/// Descriptive unit metadata, frozen at task creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub index: usize,
    pub title: String,
}

/// The durable unit of record: everything needed to resume a task after a
/// process restart.
///
/// Items are deliberately absent. Only unit-level completion is checkpointed;
/// item lists are re-fetched fresh on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub task_type: TaskType,
    pub target: TaskTarget,
    /// The full ordered plan, fixed at task creation.
    pub unit_indices: Vec<usize>,
    /// Metadata for all units, frozen at task creation.
    pub unit_snapshot: Vec<UnitInfo>,
    /// Monotonically growing subset of `unit_indices`.
    pub completed_unit_indices: BTreeSet<usize>,
    pub config: TaskConfig,
    pub status: TaskStatus,
    pub last_update_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl TaskState {
    /// Transition to a new status, refreshing timestamps.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, target
            ));
        }
        self.status = target;
        self.last_update_time = Utc::now();
        if target == TaskStatus::Completed {
            self.completion_time = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a unit as fully drained. Idempotent; the completed set only
    /// grows.
    pub fn mark_unit_completed(&mut self, unit_index: usize) {
        debug_assert!(
            self.unit_indices.contains(&unit_index),
            "unit {unit_index} is not in the plan"
        );
        self.completed_unit_indices.insert(unit_index);
        self.last_update_time = Utc::now();
    }

    /// Units still to be executed, in plan order.
    pub fn remaining_units(&self) -> Vec<usize> {
        self.unit_indices
            .iter()
            .copied()
            .filter(|idx| !self.completed_unit_indices.contains(idx))
            .collect()
    }

    /// Whether every planned unit has drained.
    pub fn is_complete(&self) -> bool {
        self.remaining_units().is_empty()
    }

    /// Snapshot written at unit boundaries. On disk every incomplete record
    /// is a pause-point, so a crash mid-run leaves a resumable record;
    /// `Running` exists only in memory.
    pub fn checkpoint(&self) -> TaskState {
        let mut snapshot = self.clone();
        snapshot.status = TaskStatus::Paused;
        snapshot.last_update_time = Utc::now();
        snapshot
    }

    /// Derive the state for a resumed run: a fresh task id with the same
    /// target, plan, snapshot, config and completed set. The caller deletes
    /// the old record once the new run has begun.
    pub fn resumed(&self) -> TaskState {
        let mut state = self.clone();
        state.task_id = super::descriptor::generate_task_id(self.task_type, &self.target);
        state.status = TaskStatus::Running;
        state.last_update_time = Utc::now();
        state.completion_time = None;
        state
    }

    /// UI-facing projection of this state.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.task_id.clone(),
            task_type: self.task_type,
            course_id: self.target.course_id.clone(),
            completed_units: self.completed_unit_indices.len(),
            total_units: self.unit_indices.len(),
            last_update_time: self.last_update_time,
            last_update_time_str: self
                .last_update_time
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        }
    }
}

/// What the UI collaborator sees when listing incomplete tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub task_type: TaskType,
    pub course_id: String,
    pub completed_units: usize,
    pub total_units: usize,
    pub last_update_time: DateTime<Utc>,
    pub last_update_time_str: String,
}
