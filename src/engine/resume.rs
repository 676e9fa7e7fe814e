//! Discovery and rehydration of interrupted tasks.

use std::sync::Arc;

use crate::engine::coordinator::ExecutionCoordinator;
use crate::error::{Error, ResumeError, StoreError};
use crate::events::EventSender;
use crate::executor::Executor;
use crate::store::ProgressStore;
use crate::task::{TaskStatus, TaskSummary};

/// Startup-time surface over the progress store: list what was interrupted,
/// rehydrate one selection into a fresh coordinator run, or discard
/// everything.
pub struct ResumeManager {
    store: ProgressStore,
}

impl ResumeManager {
    pub fn new(store: ProgressStore) -> Self {
        Self { store }
    }

    /// Summaries of every paused task, newest first, for the UI collaborator.
    pub async fn list_incomplete(&self) -> Vec<TaskSummary> {
        self.store
            .list_incomplete()
            .await
            .iter()
            .map(|state| state.summary())
            .collect()
    }

    /// Rehydrate one paused task into a fresh coordinator run.
    ///
    /// The run gets a new task id; completed units are skipped, remaining
    /// units re-fetch their item lists fresh, and duration-mode budgets are
    /// recomputed rather than replayed. The old record is deleted only once
    /// the new run begins, so a failure here leaves the checkpoint intact.
    /// One task resumes per call; other selections stay paused for a later
    /// pass.
    pub async fn resume<E: Executor + 'static>(
        &self,
        task_id: &str,
        executor: Arc<E>,
        events: EventSender,
    ) -> Result<ExecutionCoordinator<E>, Error> {
        let old = self
            .store
            .load(task_id)
            .await
            .ok_or_else(|| ResumeError::NotFound {
                task_id: task_id.to_string(),
            })?;
        if old.status != TaskStatus::Paused {
            return Err(ResumeError::NotResumable {
                task_id: task_id.to_string(),
                status: old.status.to_string(),
            }
            .into());
        }

        let state = old.resumed();
        tracing::info!(
            old_task_id = %old.task_id,
            task_id = %state.task_id,
            remaining_units = state.remaining_units().len(),
            "Resuming task under a new id"
        );
        let coordinator =
            ExecutionCoordinator::new(state, executor, self.store.clone(), events)?;
        Ok(coordinator.superseding(old.task_id))
    }

    /// Operator surface: delete every paused record. Returns how many were
    /// discarded.
    pub async fn discard_all(&self) -> Result<usize, StoreError> {
        let mut discarded = 0;
        for state in self.store.list_incomplete().await {
            if self.store.delete(&state.task_id).await? {
                tracing::info!(task_id = %state.task_id, "Discarded incomplete task");
                discarded += 1;
            }
        }
        Ok(discarded)
    }
}
