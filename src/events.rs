//! Progress events emitted by a coordinator run.
//!
//! The coordinator writes typed events to a channel and knows nothing about
//! rendering; the UI collaborator holds the receiving end. A dropped
//! receiver never blocks or fails the run.

use tokio::sync::mpsc;

use crate::engine::coordinator::TaskReport;
use crate::executor::ItemOutcome;
use crate::task::TaskType;

/// Why an item was not scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The remote marks the item as not visible.
    Hidden,
    /// The remote already counts the item as done.
    AlreadyDone,
}

/// Live progress from a running task.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    TaskStarted {
        task_id: String,
        task_type: TaskType,
        total_units: usize,
    },
    UnitStarted {
        unit_index: usize,
    },
    /// The unit's item list could not be retrieved; the unit contributes
    /// zero items and the task continues.
    UnitFetchFailed {
        unit_index: usize,
        reason: String,
    },
    ItemStarted {
        unit_index: usize,
        item_id: String,
        label: String,
    },
    ItemSkipped {
        unit_index: usize,
        item_id: String,
        label: String,
        reason: SkipReason,
    },
    ItemFinished {
        unit_index: usize,
        item_id: String,
        label: String,
        outcome: ItemOutcome,
    },
    /// Running completion count over the scheduled total.
    Progress {
        finished: usize,
        total: usize,
    },
    UnitFinished {
        unit_index: usize,
        succeeded: u64,
        failed: u64,
    },
    /// A checkpoint write failed; the run continues but is not resumable
    /// until a later save succeeds.
    CheckpointFailed {
        reason: String,
    },
    TaskPaused {
        task_id: String,
    },
    TaskFinished {
        report: TaskReport,
    },
}

/// Sending half of the progress channel. Cheap to clone into item jobs.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl EventSender {
    /// Create a connected sender/receiver pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that discards every event (headless runs, tests).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Fire-and-forget emit.
    pub fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_order() {
        let (events, mut rx) = EventSender::channel();
        events.send(ProgressEvent::UnitStarted { unit_index: 0 });
        events.send(ProgressEvent::UnitFinished {
            unit_index: 0,
            succeeded: 2,
            failed: 0,
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::UnitStarted { unit_index: 0 }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            ProgressEvent::UnitFinished { unit_index: 0, .. }
        ));
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (events, rx) = EventSender::channel();
        drop(rx);
        events.send(ProgressEvent::UnitStarted { unit_index: 1 });
    }

    #[test]
    fn disabled_sender_is_silent() {
        let events = EventSender::disabled();
        events.send(ProgressEvent::UnitStarted { unit_index: 0 });
    }
}
