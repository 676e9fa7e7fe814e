//! Turns a task state into item-level work and aggregates the results.
//!
//! One coordinator task drives the whole run: it fetches unit item lists,
//! dispatches jobs through a [`WorkerPool`], consumes completions, and is the
//! single writer of the task's progress (completed units, counters). Two
//! strategies share the machinery: fill mode drains one unit at a time,
//! duration mode flattens every unit's items into a single batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;

use crate::config::TaskConfig;
use crate::engine::pool::{StopToken, WorkerPool};
use crate::error::{ConfigError, Result};
use crate::events::{EventSender, ProgressEvent, SkipReason};
use crate::executor::{Executor, ItemOutcome, ItemParams, ItemRecord};
use crate::store::ProgressStore;
use crate::task::{TaskState, TaskStatus, TaskTarget, TaskType};

/// How long a stopping run waits for in-flight jobs before forced cancel.
const STOP_DRAIN_GRACE: Duration = Duration::from_secs(4);

/// Aggregate outcome of one coordinator run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    /// `Completed` when every unit drained, `Paused` when stopped early.
    pub status: TaskStatus,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped_hidden: u64,
    pub already_done: u64,
    pub completed_unit_indices: Vec<usize>,
}

/// One schedulable item job.
#[derive(Debug, Clone)]
struct ItemJob {
    unit_index: usize,
    item: ItemRecord,
    params: ItemParams,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    succeeded: u64,
    failed: u64,
    skipped_hidden: u64,
    already_done: u64,
}

/// Per-unit drain bookkeeping for an executing batch.
struct UnitProgress {
    outstanding: usize,
    succeeded: u64,
    failed: u64,
}

impl UnitProgress {
    fn new(outstanding: usize) -> Self {
        Self {
            outstanding,
            succeeded: 0,
            failed: 0,
        }
    }
}

/// Orchestrates one task run.
pub struct ExecutionCoordinator<E> {
    state: TaskState,
    executor: Arc<E>,
    store: ProgressStore,
    events: EventSender,
    stop: StopToken,
    /// Checkpoint this run supersedes; deleted once the run has begun.
    supersedes: Option<String>,
    drain_grace: Duration,
    counters: Counters,
}

impl<E: Executor + 'static> ExecutionCoordinator<E> {
    /// Build a coordinator over a fresh or rehydrated state.
    ///
    /// Validates target identifiers, config bounds, and the unit plan; this
    /// is the only surface that fails hard, and it fails before any work is
    /// dispatched.
    pub fn new(
        state: TaskState,
        executor: Arc<E>,
        store: ProgressStore,
        events: EventSender,
    ) -> std::result::Result<Self, ConfigError> {
        state.target.validate()?;
        state.config.validate()?;
        if state.unit_indices.is_empty() {
            return Err(ConfigError::EmptyUnitPlan);
        }
        Ok(Self {
            state,
            executor,
            store,
            events,
            stop: StopToken::new(),
            supersedes: None,
            drain_grace: STOP_DRAIN_GRACE,
            counters: Counters::default(),
        })
    }

    /// Mark `old_task_id`'s checkpoint as superseded by this run. It is
    /// deleted once the run has begun, never before, so a failed resume
    /// leaves the old checkpoint intact.
    pub(crate) fn superseding(mut self, old_task_id: String) -> Self {
        self.supersedes = Some(old_task_id);
        self
    }

    /// Override how long a stopping run waits for in-flight jobs before
    /// escalating to forced cancel.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Handle for requesting a cooperative stop from outside the run.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn task_id(&self) -> &str {
        &self.state.task_id
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Drive the task to completion or to a paused checkpoint.
    pub async fn run(mut self) -> Result<TaskReport> {
        tracing::info!(
            task_id = %self.state.task_id,
            task_type = %self.state.task_type,
            units = self.state.unit_indices.len(),
            completed = self.state.completed_unit_indices.len(),
            "Task run starting"
        );
        self.events.send(ProgressEvent::TaskStarted {
            task_id: self.state.task_id.clone(),
            task_type: self.state.task_type,
            total_units: self.state.unit_indices.len(),
        });

        if let Some(old_id) = self.supersedes.take() {
            match self.store.delete(&old_id).await {
                Ok(_) => tracing::debug!(task_id = %old_id, "Superseded checkpoint removed"),
                Err(e) => tracing::warn!(
                    task_id = %old_id,
                    error = %e,
                    "Failed to remove superseded checkpoint"
                ),
            }
        }

        match self.state.task_type {
            TaskType::FillMode => self.run_fill().await?,
            TaskType::DurationMode => self.run_duration().await?,
        }

        self.finish().await
    }

    /// Fill mode: units one at a time in plan order, items within a unit in
    /// parallel. Each unit drains fully before the next starts.
    async fn run_fill(&mut self) -> Result<()> {
        for unit_index in self.state.remaining_units() {
            if self.stop.is_stopped() {
                break;
            }
            self.events.send(ProgressEvent::UnitStarted { unit_index });
            tracing::info!(unit = unit_index, "Unit starting");

            let items = match self.schedulable_items(unit_index).await {
                Ok(items) => items,
                Err(reason) => {
                    self.events.send(ProgressEvent::UnitFetchFailed { unit_index, reason });
                    self.complete_unit(unit_index, 0, 0).await;
                    continue;
                }
            };
            if items.is_empty() {
                self.complete_unit(unit_index, 0, 0).await;
                continue;
            }

            let jobs: Vec<ItemJob> = items
                .into_iter()
                .map(|item| ItemJob {
                    unit_index,
                    params: ItemParams::Completion {
                        accuracy: self.state.config.accuracy.sample(),
                    },
                    item,
                })
                .collect();
            let mut outstanding = BTreeMap::new();
            outstanding.insert(unit_index, UnitProgress::new(jobs.len()));

            let pool = WorkerPool::new(self.state.config.max_concurrency, self.stop.clone())?;
            let interrupted = self.execute_batch(&pool, jobs, &mut outstanding).await;
            if interrupted {
                break;
            }
        }
        Ok(())
    }

    /// Duration mode: fetch every remaining unit up front, fix each unit's
    /// time budget at fetch time, then run the flattened item list through a
    /// single pool so the concurrency budget spans the whole task.
    async fn run_duration(&mut self) -> Result<()> {
        let mut outstanding = BTreeMap::new();
        let mut flattened: Vec<ItemJob> = Vec::new();

        for unit_index in self.state.remaining_units() {
            if self.stop.is_stopped() {
                break;
            }
            self.events.send(ProgressEvent::UnitStarted { unit_index });

            let items = match self.schedulable_items(unit_index).await {
                Ok(items) => items,
                Err(reason) => {
                    self.events.send(ProgressEvent::UnitFetchFailed { unit_index, reason });
                    self.complete_unit(unit_index, 0, 0).await;
                    continue;
                }
            };
            if items.is_empty() {
                self.complete_unit(unit_index, 0, 0).await;
                continue;
            }

            let seconds = per_item_seconds(&self.state.config, items.len());
            tracing::info!(
                unit = unit_index,
                items = items.len(),
                per_item_seconds = seconds,
                "Unit time budget fixed"
            );
            outstanding.insert(unit_index, UnitProgress::new(items.len()));
            flattened.extend(items.into_iter().map(|item| ItemJob {
                unit_index,
                params: ItemParams::Duration { seconds },
                item,
            }));
        }

        // A stop during the prepare pass means nothing new gets dispatched.
        if flattened.is_empty() || self.stop.is_stopped() {
            return Ok(());
        }
        tracing::info!(items = flattened.len(), "Dispatching flattened batch");
        let pool = WorkerPool::new(self.state.config.max_concurrency, self.stop.clone())?;
        self.execute_batch(&pool, flattened, &mut outstanding).await;
        Ok(())
    }

    /// Fetch one unit's items and filter to the schedulable set, reporting
    /// and counting both skip classes. Returns the fetch failure as a
    /// message; the caller treats the unit as drained with zero items.
    async fn schedulable_items(
        &mut self,
        unit_index: usize,
    ) -> std::result::Result<Vec<ItemRecord>, String> {
        let items = match self
            .executor
            .unit_items(&self.state.target, unit_index)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(unit = unit_index, error = %e, "Failed to fetch unit items");
                return Err(e.to_string());
            }
        };

        let mut schedulable = Vec::new();
        for item in items {
            if !item.visible {
                self.counters.skipped_hidden += 1;
                self.events.send(ProgressEvent::ItemSkipped {
                    unit_index,
                    item_id: item.id.clone(),
                    label: item.label.clone(),
                    reason: SkipReason::Hidden,
                });
            } else if item.already_done {
                self.counters.already_done += 1;
                self.events.send(ProgressEvent::ItemSkipped {
                    unit_index,
                    item_id: item.id.clone(),
                    label: item.label.clone(),
                    reason: SkipReason::AlreadyDone,
                });
            } else {
                schedulable.push(item);
            }
        }
        Ok(schedulable)
    }

    /// Consume completions until the batch is exhausted or a stop is
    /// observed. After a stop, in-flight jobs get the drain grace to finish
    /// naturally; stragglers past that are force-cancelled. Returns whether
    /// the batch was interrupted.
    async fn execute_batch(
        &mut self,
        pool: &WorkerPool,
        jobs: Vec<ItemJob>,
        outstanding: &mut BTreeMap<usize, UnitProgress>,
    ) -> bool {
        let total = jobs.len();
        let runner = item_runner(
            Arc::clone(&self.executor),
            self.state.target.clone(),
            self.events.clone(),
        );
        let mut rx = pool.submit(jobs, runner).await;
        let stop = self.stop.clone();
        let mut finished = 0usize;

        let interrupted = loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some((job, outcome)) => {
                        self.record(job, outcome, outstanding, &mut finished, total)
                            .await;
                    }
                    None => break false,
                },
                _ = stop.stopped() => break true,
            }
        };

        if interrupted {
            tracing::info!("Stop requested, waiting for in-flight jobs to drain");
            let grace = self.drain_grace;
            // Collect inside the timeout, record outside it, so an expiring
            // grace never cancels a checkpoint write midway.
            let mut late = Vec::new();
            let drained = tokio::time::timeout(grace, async {
                while let Some(pair) = rx.recv().await {
                    late.push(pair);
                }
            })
            .await;
            for (job, outcome) in late {
                self.record(job, outcome, outstanding, &mut finished, total)
                    .await;
            }
            if drained.is_err() {
                // Last resort. The underlying remote operation cannot be
                // interrupted and may be leaked.
                let aborted = pool.abort_pending(Duration::ZERO).await;
                if aborted > 0 {
                    tracing::warn!(
                        aborted,
                        "Forced cancel of jobs still in flight past the drain grace"
                    );
                }
            }
        }
        interrupted
    }

    /// Fold one completion into counters, events, and per-unit bookkeeping;
    /// checkpoint the unit when its last item drains.
    async fn record(
        &mut self,
        job: ItemJob,
        outcome: ItemOutcome,
        outstanding: &mut BTreeMap<usize, UnitProgress>,
        finished: &mut usize,
        total: usize,
    ) {
        match outcome {
            ItemOutcome::Success => self.counters.succeeded += 1,
            ItemOutcome::Failure => self.counters.failed += 1,
        }
        self.events.send(ProgressEvent::ItemFinished {
            unit_index: job.unit_index,
            item_id: job.item.id.clone(),
            label: job.item.label.clone(),
            outcome,
        });
        *finished += 1;
        self.events.send(ProgressEvent::Progress {
            finished: *finished,
            total,
        });

        let unit_drained = match outstanding.get_mut(&job.unit_index) {
            Some(progress) => {
                match outcome {
                    ItemOutcome::Success => progress.succeeded += 1,
                    ItemOutcome::Failure => progress.failed += 1,
                }
                progress.outstanding -= 1;
                progress.outstanding == 0
            }
            None => false,
        };
        if unit_drained {
            if let Some(progress) = outstanding.remove(&job.unit_index) {
                self.complete_unit(job.unit_index, progress.succeeded, progress.failed)
                    .await;
            }
        }
    }

    /// Record a unit as fully drained and checkpoint. This is the only
    /// checkpoint granularity; items are never persisted.
    async fn complete_unit(&mut self, unit_index: usize, succeeded: u64, failed: u64) {
        self.state.mark_unit_completed(unit_index);
        tracing::info!(unit = unit_index, succeeded, failed, "Unit finished");
        self.events.send(ProgressEvent::UnitFinished {
            unit_index,
            succeeded,
            failed,
        });
        self.save_checkpoint().await;
    }

    /// Persist the current pause-point. A failure is logged and reported but
    /// never aborts the in-memory run.
    async fn save_checkpoint(&mut self) {
        if let Err(e) = self.store.save(&self.state.checkpoint()).await {
            tracing::error!(
                task_id = %self.state.task_id,
                error = %e,
                "Checkpoint save failed; the task is not resumable until a later save succeeds"
            );
            self.events.send(ProgressEvent::CheckpointFailed {
                reason: e.to_string(),
            });
        }
    }

    async fn finish(mut self) -> Result<TaskReport> {
        if self.state.is_complete() {
            if let Err(e) = self.state.transition_to(TaskStatus::Completed) {
                tracing::error!(task_id = %self.state.task_id, error = %e, "Invalid status transition");
            }
            // No terminal records accumulate in the store.
            if let Err(e) = self.store.delete(&self.state.task_id).await {
                tracing::error!(
                    task_id = %self.state.task_id,
                    error = %e,
                    "Failed to remove completed task record"
                );
            }
            let report = self.report();
            tracing::info!(
                task_id = %report.task_id,
                succeeded = report.succeeded,
                failed = report.failed,
                "Task completed"
            );
            self.events.send(ProgressEvent::TaskFinished {
                report: report.clone(),
            });
            Ok(report)
        } else {
            if let Err(e) = self.state.transition_to(TaskStatus::Paused) {
                tracing::error!(task_id = %self.state.task_id, error = %e, "Invalid status transition");
            }
            if let Err(e) = self.store.save(&self.state).await {
                tracing::error!(
                    task_id = %self.state.task_id,
                    error = %e,
                    "Failed to save paused task; progress up to the last checkpoint survives"
                );
                self.events.send(ProgressEvent::CheckpointFailed {
                    reason: e.to_string(),
                });
            }
            tracing::info!(
                task_id = %self.state.task_id,
                completed_units = self.state.completed_unit_indices.len(),
                "Task paused"
            );
            self.events.send(ProgressEvent::TaskPaused {
                task_id: self.state.task_id.clone(),
            });
            Ok(self.report())
        }
    }

    fn report(&self) -> TaskReport {
        TaskReport {
            task_id: self.state.task_id.clone(),
            status: self.state.status,
            succeeded: self.counters.succeeded,
            failed: self.counters.failed,
            skipped_hidden: self.counters.skipped_hidden,
            already_done: self.counters.already_done,
            completed_unit_indices: self
                .state
                .completed_unit_indices
                .iter()
                .copied()
                .collect(),
        }
    }
}

/// Build the closure the pool runs per job.
fn item_runner<E: Executor + 'static>(
    executor: Arc<E>,
    target: TaskTarget,
    events: EventSender,
) -> impl Fn(ItemJob) -> BoxFuture<'static, ItemOutcome> + Clone + Send + Sync {
    move |job: ItemJob| {
        let executor = Arc::clone(&executor);
        let target = target.clone();
        let events = events.clone();
        async move {
            events.send(ProgressEvent::ItemStarted {
                unit_index: job.unit_index,
                item_id: job.item.id.clone(),
                label: job.item.label.clone(),
            });
            executor.submit_item(&target, &job.item.id, job.params).await
        }
        .boxed()
    }
}

/// A unit's per-item duration: target minutes ± uniform jitter, clamped to
/// at least one minute, converted to seconds and split evenly across the
/// unit's schedulable items. Computed once, when the unit's items are
/// fetched; a resumed unit gets a fresh draw.
fn per_item_seconds(config: &TaskConfig, item_count: usize) -> u64 {
    let jitter = i64::from(config.jitter_minutes);
    let offset = if jitter == 0 {
        0
    } else {
        rand::thread_rng().gen_range(-jitter..=jitter)
    };
    let minutes = (i64::from(config.duration_minutes) + offset).max(1) as u64;
    minutes * 60 / item_count.max(1) as u64
}
