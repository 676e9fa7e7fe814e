//! Durable persistence of task states.
//!
//! One JSON document maps `task_id -> TaskState` and is rewritten in full on
//! every save; there are no partial or append writes. At most one coordinator
//! writes a given task id at a time by construction, so the only locking is
//! an in-process mutex around the read-modify-write cycle. Concurrent access
//! from multiple processes is not supported.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::task::{TaskState, TaskStatus};

/// Handle to the progress document. Cheap to clone; clones share the same
/// in-memory view and backing file.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
    records: Arc<Mutex<HashMap<String, TaskState>>>,
}

impl ProgressStore {
    /// Open the store at `path`, loading any existing document.
    ///
    /// A missing file starts empty; an unreadable or corrupt one is logged
    /// and treated as empty rather than failing startup.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Progress file is corrupt, starting empty"
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read progress file, starting empty"
                );
                HashMap::new()
            }
        };

        Self {
            path,
            records: Arc::new(Mutex::new(records)),
        }
    }

    /// Upsert one record and rewrite the backing file.
    pub async fn save(&self, state: &TaskState) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        records.insert(state.task_id.clone(), state.clone());
        self.write(&records).await
    }

    /// Fetch one record.
    pub async fn load(&self, task_id: &str) -> Option<TaskState> {
        self.records.lock().await.get(task_id).cloned()
    }

    /// Remove one record. Idempotent: deleting an absent id is `Ok(false)`.
    pub async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        if records.remove(task_id).is_none() {
            return Ok(false);
        }
        self.write(&records).await?;
        Ok(true)
    }

    /// All paused records, most recently updated first.
    pub async fn list_incomplete(&self) -> Vec<TaskState> {
        let records = self.records.lock().await;
        let mut tasks: Vec<TaskState> = records
            .values()
            .filter(|state| state.status == TaskStatus::Paused)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.last_update_time.cmp(&a.last_update_time));
        tasks
    }

    async fn write(&self, records: &HashMap<String, TaskState>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(records)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}
