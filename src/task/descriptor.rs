//! Task construction.

use chrono::Utc;
use uuid::Uuid;

use crate::config::TaskConfig;
use crate::error::ConfigError;
use crate::task::state::{TaskState, TaskStatus, TaskTarget, TaskType, UnitInfo};

/// Everything a caller provides to start a new task.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub task_type: TaskType,
    pub target: TaskTarget,
    /// Ordered unit plan.
    pub unit_indices: Vec<usize>,
    /// Descriptive metadata for the planned units, frozen into the state.
    pub unit_snapshot: Vec<UnitInfo>,
    pub config: TaskConfig,
}

impl TaskDescriptor {
    /// Validate target identifiers, config and plan. Fatal before any work
    /// is dispatched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.target.validate()?;
        self.config.validate()?;
        if self.unit_indices.is_empty() {
            return Err(ConfigError::EmptyUnitPlan);
        }
        Ok(())
    }

    /// Turn the descriptor into a fresh running state with a new task id.
    pub fn into_state(self) -> Result<TaskState, ConfigError> {
        self.validate()?;
        Ok(TaskState {
            task_id: generate_task_id(self.task_type, &self.target),
            task_type: self.task_type,
            target: self.target,
            unit_indices: self.unit_indices,
            unit_snapshot: self.unit_snapshot,
            completed_unit_indices: Default::default(),
            config: self.config,
            status: TaskStatus::Running,
            last_update_time: Utc::now(),
            completion_time: None,
        })
    }
}

/// Readable, globally unique task id: type and target for humans, a UUID
/// suffix for uniqueness across back-to-back runs.
pub fn generate_task_id(task_type: TaskType, target: &TaskTarget) -> String {
    format!(
        "{}_{}_{}_{}",
        task_type,
        target.course_id,
        target.account_id,
        Uuid::new_v4().simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor {
            task_type: TaskType::DurationMode,
            target: TaskTarget {
                course_id: "c-7".to_string(),
                account_id: "u-2".to_string(),
                class_id: "k-1".to_string(),
            },
            unit_indices: vec![3, 4],
            unit_snapshot: vec![
                UnitInfo {
                    index: 3,
                    title: "Unit 4".to_string(),
                },
                UnitInfo {
                    index: 4,
                    title: "Unit 5".to_string(),
                },
            ],
            config: TaskConfig::default(),
        }
    }

    #[test]
    fn into_state_starts_running_with_empty_progress() {
        let state = descriptor().into_state().unwrap();
        assert_eq!(state.status, TaskStatus::Running);
        assert!(state.completed_unit_indices.is_empty());
        assert_eq!(state.unit_indices, vec![3, 4]);
        assert!(state.completion_time.is_none());
    }

    #[test]
    fn empty_plan_rejected() {
        let mut desc = descriptor();
        desc.unit_indices.clear();
        assert!(matches!(
            desc.into_state(),
            Err(ConfigError::EmptyUnitPlan)
        ));
    }

    #[test]
    fn invalid_config_rejected_at_construction() {
        let mut desc = descriptor();
        desc.config.max_concurrency = 0;
        assert!(desc.into_state().is_err());
    }

    #[test]
    fn blank_target_rejected_at_construction() {
        let mut desc = descriptor();
        desc.target.account_id.clear();
        assert!(matches!(
            desc.into_state(),
            Err(ConfigError::MissingTarget { field: "account_id" })
        ));
    }

    #[test]
    fn task_ids_are_unique_and_readable() {
        let desc = descriptor();
        let a = generate_task_id(desc.task_type, &desc.target);
        let b = generate_task_id(desc.task_type, &desc.target);
        assert_ne!(a, b);
        assert!(a.starts_with("duration_mode_c-7_u-2_"));
    }
}
