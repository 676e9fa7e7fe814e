//! External collaborator seam: the client that performs a single item's
//! remote operation.
//!
//! The engine never talks to the network itself. It fetches item lists and
//! submits item operations through this trait, and treats everything behind
//! it as a black box.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::task::TaskTarget;

/// One remote item as reported by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Remote identifier, opaque to the engine.
    pub id: String,
    /// Human-readable label for progress events.
    pub label: String,
    /// Hidden items are never scheduled.
    pub visible: bool,
    /// Items the remote already counts as done are never re-submitted.
    pub already_done: bool,
}

/// Parameters for one item submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemParams {
    /// Fill mode: report the item completed with this accuracy percent.
    Completion { accuracy: u8 },
    /// Duration mode: report this much study time, in seconds.
    Duration { seconds: u64 },
}

/// Outcome of one item job.
///
/// Failures are values, not errors: they are counted and the run continues.
/// There is no retry within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    Failure,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// The remote-operation collaborator.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Fetch the ordered item list for one unit.
    async fn unit_items(
        &self,
        target: &TaskTarget,
        unit_index: usize,
    ) -> Result<Vec<ItemRecord>, FetchError>;

    /// Perform the remote operation for a single item.
    ///
    /// Implementations report failure as a value; the engine converts any
    /// panic below this call into [`ItemOutcome::Failure`] at the pool
    /// boundary.
    async fn submit_item(
        &self,
        target: &TaskTarget,
        item_id: &str,
        params: ItemParams,
    ) -> ItemOutcome;
}
