//! Bounded-concurrency worker pool for item jobs.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::error::ConfigError;
use crate::executor::ItemOutcome;

/// Cooperative stop signal shared by a coordinator run and its pools.
///
/// Checked before each dispatch; jobs already running are never interrupted
/// by the flag itself.
#[derive(Debug, Clone)]
pub struct StopToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request a stop. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes a batch of item jobs with at most `limit` in flight at once.
///
/// Jobs are spawned as tokio tasks gated by a semaphore; completion pairs
/// arrive on the returned channel in completion order, not submission order.
/// A job's outcome is always a value: no retries, and a panic inside a job
/// is converted to [`ItemOutcome::Failure`] at this boundary.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    stop: StopToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WorkerPool {
    /// Create a pool with the given in-flight limit, in [1, 100].
    pub fn new(limit: usize, stop: StopToken) -> Result<Self, ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&limit) {
            return Err(ConfigError::ConcurrencyOutOfRange {
                value: limit,
                min: MIN_CONCURRENCY,
                max: MAX_CONCURRENCY,
            });
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(limit)),
            stop,
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Submit a batch of jobs. The receiver closes once every job has either
    /// completed or been skipped by a stop.
    pub async fn submit<J, F, Fut>(
        &self,
        jobs: Vec<J>,
        run: F,
    ) -> mpsc::UnboundedReceiver<(J, ItemOutcome)>
    where
        J: Clone + Send + 'static,
        F: Fn(J) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ItemOutcome> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = self.tasks.lock().await;
        for job in jobs {
            let permits = Arc::clone(&self.permits);
            let stop = self.stop.clone();
            let run = run.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                if stop.is_stopped() {
                    return;
                }
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                // Re-checked under the permit: a stop must prevent dispatch
                // of jobs that were queued but had not started yet.
                if stop.is_stopped() {
                    return;
                }
                let outcome = match AssertUnwindSafe(run(job.clone())).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => ItemOutcome::Failure,
                };
                let _ = tx.send((job, outcome));
            }));
        }
        rx
    }

    /// Request a cooperative stop: no further jobs are dispatched.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    /// Number of jobs not yet finished (in flight or awaiting a permit).
    pub async fn pending(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|handle| !handle.is_finished());
        tasks.len()
    }

    /// Wait up to `grace` for outstanding jobs to finish on their own, then
    /// abort whatever is left. Returns the number of aborted jobs.
    ///
    /// Aborting is best-effort and unsafe: the underlying remote operation
    /// cannot be interrupted mid-flight and may be leaked. Last resort only.
    pub async fn abort_pending(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        loop {
            if self.pending().await == 0 {
                return 0;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|handle| !handle.is_finished());
        let aborted = tasks.len();
        for handle in tasks.drain(..) {
            handle.abort();
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn pool(limit: usize) -> WorkerPool {
        WorkerPool::new(limit, StopToken::new()).unwrap()
    }

    #[test]
    fn limit_bounds_enforced() {
        assert!(WorkerPool::new(0, StopToken::new()).is_err());
        assert!(WorkerPool::new(101, StopToken::new()).is_err());
        assert!(WorkerPool::new(1, StopToken::new()).is_ok());
        assert!(WorkerPool::new(100, StopToken::new()).is_ok());
    }

    #[tokio::test]
    async fn all_jobs_complete_and_report() {
        let pool = pool(4);
        let jobs: Vec<usize> = (0..10).collect();
        let mut rx = pool
            .submit(jobs, |n| async move {
                if n % 2 == 0 {
                    ItemOutcome::Success
                } else {
                    ItemOutcome::Failure
                }
            })
            .await;

        let mut succeeded = 0;
        let mut failed = 0;
        while let Some((_, outcome)) = rx.recv().await {
            match outcome {
                ItemOutcome::Success => succeeded += 1,
                ItemOutcome::Failure => failed += 1,
            }
        }
        assert_eq!(succeeded, 5);
        assert_eq!(failed, 5);
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_limit() {
        let limit = 3;
        let pool = pool(limit);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<usize> = (0..20).collect();
        let in_flight_c = Arc::clone(&in_flight);
        let high_water_c = Arc::clone(&high_water);
        let mut rx = pool
            .submit(jobs, move |_| {
                let in_flight = Arc::clone(&in_flight_c);
                let high_water = Arc::clone(&high_water_c);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    ItemOutcome::Success
                }
            })
            .await;

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 20);
        assert!(
            high_water.load(Ordering::SeqCst) <= limit,
            "observed {} jobs in flight with limit {limit}",
            high_water.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn single_worker_never_overlaps() {
        let pool = pool(1);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let in_flight_c = Arc::clone(&in_flight);
        let mut rx = pool
            .submit((0..8).collect::<Vec<usize>>(), move |_| {
                let in_flight = Arc::clone(&in_flight_c);
                async move {
                    assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0, "overlap");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    ItemOutcome::Success
                }
            })
            .await;

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 8);
    }

    #[tokio::test]
    async fn stop_prevents_undispatched_jobs() {
        let stop = StopToken::new();
        let pool = WorkerPool::new(1, stop.clone()).unwrap();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let started_c = Arc::clone(&started);
        let release_c = Arc::clone(&release);
        let mut rx = pool
            .submit((0..3).collect::<Vec<usize>>(), move |_| {
                let started = Arc::clone(&started_c);
                let release = Arc::clone(&release_c);
                async move {
                    started.notify_one();
                    release.notified().await;
                    ItemOutcome::Success
                }
            })
            .await;

        // One job is in flight; stop before releasing it.
        started.notified().await;
        stop.trigger();
        release.notify_one();

        let mut outcomes = Vec::new();
        while let Some(pair) = rx.recv().await {
            outcomes.push(pair);
        }
        // The in-flight job ran to completion, the queued ones were skipped.
        assert_eq!(outcomes.len(), 1);
    }

    #[tokio::test]
    async fn panic_inside_job_counts_as_failure() {
        let pool = pool(2);
        let mut rx = pool
            .submit(vec![1usize, 2], |n| async move {
                if n == 1 {
                    panic!("job blew up");
                }
                ItemOutcome::Success
            })
            .await;

        let mut outcomes = Vec::new();
        while let Some((n, outcome)) = rx.recv().await {
            outcomes.push((n, outcome));
        }
        outcomes.sort_by_key(|(n, _)| *n);
        assert_eq!(
            outcomes,
            vec![(1, ItemOutcome::Failure), (2, ItemOutcome::Success)]
        );
    }

    #[tokio::test]
    async fn abort_pending_force_cancels_stragglers() {
        let stop = StopToken::new();
        let pool = WorkerPool::new(2, stop.clone()).unwrap();
        let mut rx = pool
            .submit(vec![1usize, 2], |_| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ItemOutcome::Success
            })
            .await;

        stop.trigger();
        let aborted = pool.abort_pending(Duration::from_millis(100)).await;
        assert_eq!(aborted, 2);
        // Every sender is gone, so the channel closes without outcomes.
        assert!(rx.recv().await.is_none());
        assert_eq!(pool.pending().await, 0);
    }

    #[tokio::test]
    async fn abort_pending_is_noop_when_drained() {
        let pool = pool(2);
        let mut rx = pool
            .submit(vec![1usize], |_| async move { ItemOutcome::Success })
            .await;
        while rx.recv().await.is_some() {}
        assert_eq!(pool.abort_pending(Duration::from_millis(10)).await, 0);
    }

    #[tokio::test]
    async fn stop_token_is_awaitable() {
        let stop = StopToken::new();
        assert!(!stop.is_stopped());

        let waiter = stop.clone();
        let handle = tokio::spawn(async move {
            waiter.stopped().await;
        });
        stop.trigger();
        handle.await.unwrap();
        assert!(stop.is_stopped());
    }
}
