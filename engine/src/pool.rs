//! Bounded worker pool with a consecutive-failure abort threshold.
//!
//! Tasks are handed to workers one at a time over a rendezvous channel, so a
//! cancelled run never has a backlog of queued work: at most one task per
//! worker is in flight when the threshold trips, and those finish normally.

use crate::model::ResultRecord;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Where the consecutive-failure maximum takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdBoundary {
    /// Abort on the Nth consecutive failure
    Reached,
    /// Abort on the failure after the Nth
    Exceeded,
}

/// Run-scoped count of consecutive per-file failures.
#[derive(Debug)]
pub struct FailureCounter {
    consecutive: AtomicUsize,
    max: Option<usize>,
    boundary: ThresholdBoundary,
    tripped: AtomicBool,
}

impl FailureCounter {
    /// `max = None` never trips.
    pub fn new(max: Option<usize>, boundary: ThresholdBoundary) -> Self {
        FailureCounter {
            consecutive: AtomicUsize::new(0),
            max,
            boundary,
            tripped: AtomicBool::new(false),
        }
    }

    /// Count a failure. Returns true once the threshold has tripped.
    pub fn record_failure(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(max) = self.max {
            let limit = match self.boundary {
                ThresholdBoundary::Reached => max,
                ThresholdBoundary::Exceeded => max + 1,
            };
            if count >= limit {
                self.tripped.store(true, Ordering::SeqCst);
            }
        }
        self.is_tripped()
    }

    /// Any success resets the run of failures.
    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    pub fn consecutive(&self) -> usize {
        self.consecutive.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> Option<usize> {
        self.max
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

/// Cooperative stop signal shared by the dispatcher and workers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A task result the pool can classify for the failure counter.
pub trait TaskOutcome {
    fn is_failure(&self) -> bool;
}

impl TaskOutcome for ResultRecord {
    fn is_failure(&self) -> bool {
        ResultRecord::is_failure(self)
    }
}

/// What happened to the tasks handed to [`WorkerPool::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// Tasks that ran to a result
    pub completed: usize,
    /// Tasks received by a worker after cancellation and not run
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        WorkerPool {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `work` over `tasks` on the pool's workers.
    ///
    /// Each result updates `counter` as soon as it is produced and is then
    /// passed to `on_result` on the calling thread, in completion order. When
    /// the counter trips, `cancel` is signalled: no further task is dispatched,
    /// while tasks already running finish.
    pub fn run<I, T, R, W, S>(
        &self,
        tasks: I,
        counter: &FailureCounter,
        cancel: &CancellationToken,
        work: W,
        mut on_result: S,
    ) -> PoolReport
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send,
        T: Send,
        R: TaskOutcome + Send,
        W: Fn(T) -> R + Sync,
        S: FnMut(R),
    {
        let (task_tx, task_rx) = crossbeam_channel::bounded::<T>(0);
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<R>();
        let skipped = AtomicUsize::new(0);
        let mut completed = 0;
        let tasks = tasks.into_iter();

        thread::scope(|scope| {
            scope.spawn(move || {
                for task in tasks {
                    if cancel.is_cancelled() {
                        debug!("dispatch stopped by cancellation");
                        break;
                    }
                    if task_tx.send(task).is_err() {
                        break;
                    }
                }
            });

            for _ in 0..self.workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let work = &work;
                let skipped = &skipped;
                scope.spawn(move || {
                    for task in task_rx.iter() {
                        if cancel.is_cancelled() {
                            skipped.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }
                        let result = work(task);
                        if result.is_failure() {
                            if counter.record_failure() && !cancel.is_cancelled() {
                                warn!(
                                    consecutive = counter.consecutive(),
                                    "consecutive failure threshold reached, stopping dispatch"
                                );
                                cancel.cancel();
                            }
                        } else {
                            counter.record_success();
                        }
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(task_rx);
            drop(result_tx);

            for result in result_rx.iter() {
                completed += 1;
                on_result(result);
            }
        });

        PoolReport {
            completed,
            skipped: skipped.into_inner(),
            cancelled: cancel.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Synthetic task result: `Err` counts as a failure.
    struct Outcome(Result<usize, usize>);

    impl TaskOutcome for Outcome {
        fn is_failure(&self) -> bool {
            self.0.is_err()
        }
    }

    fn run_sequence(
        failing: &[usize],
        total: usize,
        max: usize,
        boundary: ThresholdBoundary,
    ) -> (Vec<usize>, PoolReport) {
        let pool = WorkerPool::new(1);
        let counter = FailureCounter::new(Some(max), boundary);
        let cancel = CancellationToken::new();
        let processed = Mutex::new(Vec::new());

        let report = pool.run(
            0..total,
            &counter,
            &cancel,
            |n| {
                processed.lock().expect("Failed to lock").push(n);
                if failing.contains(&n) {
                    Outcome(Err(n))
                } else {
                    Outcome(Ok(n))
                }
            },
            |_| {},
        );
        (processed.into_inner().expect("Failed to unwrap"), report)
    }

    #[test]
    fn test_counter_reached_boundary() {
        let counter = FailureCounter::new(Some(3), ThresholdBoundary::Reached);
        assert!(!counter.record_failure());
        assert!(!counter.record_failure());
        assert!(counter.record_failure());
    }

    #[test]
    fn test_counter_exceeded_boundary() {
        let counter = FailureCounter::new(Some(3), ThresholdBoundary::Exceeded);
        for _ in 0..3 {
            assert!(!counter.record_failure());
        }
        assert!(counter.record_failure());
    }

    #[test]
    fn test_counter_success_resets() {
        let counter = FailureCounter::new(Some(2), ThresholdBoundary::Reached);
        assert!(!counter.record_failure());
        counter.record_success();
        assert_eq!(counter.consecutive(), 0);
        assert!(!counter.record_failure());
        assert!(counter.record_failure());
    }

    #[test]
    fn test_counter_without_max_never_trips() {
        let counter = FailureCounter::new(None, ThresholdBoundary::Reached);
        for _ in 0..100 {
            assert!(!counter.record_failure());
        }
    }

    #[test]
    fn test_pool_aborts_on_third_failure_when_reached() {
        // Four failing files followed by successes
        let (processed, report) = run_sequence(&[0, 1, 2, 3], 8, 3, ThresholdBoundary::Reached);
        assert_eq!(processed, vec![0, 1, 2], "nothing after the abort point may run");
        assert_eq!(report.completed, 3);
        assert!(report.cancelled);
    }

    #[test]
    fn test_pool_aborts_on_fourth_failure_when_exceeded() {
        let (processed, report) = run_sequence(&[0, 1, 2, 3], 8, 3, ThresholdBoundary::Exceeded);
        assert_eq!(processed, vec![0, 1, 2, 3]);
        assert_eq!(report.completed, 4);
        assert!(report.cancelled);
    }

    #[test]
    fn test_pool_interleaved_successes_do_not_abort() {
        let (processed, report) = run_sequence(&[0, 1, 3, 4, 6, 7], 9, 3, ThresholdBoundary::Reached);
        assert_eq!(processed.len(), 9);
        assert!(!report.cancelled);
    }

    #[test]
    fn test_pool_runs_every_task_across_workers() {
        let pool = WorkerPool::new(4);
        let counter = FailureCounter::new(Some(10), ThresholdBoundary::Reached);
        let cancel = CancellationToken::new();
        let mut results = Vec::new();

        let report = pool.run(0..50usize, &counter, &cancel, |n| Outcome(Ok(n * 2)), |r| {
            results.push(r.0.expect("no task fails"))
        });

        results.sort_unstable();
        assert_eq!(report.completed, 50);
        assert_eq!(results, (0..50).map(|n| n * 2).collect::<Vec<_>>());
    }
}
