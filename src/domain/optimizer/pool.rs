//! Bounded worker pool for independent simulation runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::debug;

/// Cooperative cancellation flag shared with the caller.
///
/// Checked between dispatches: once raised no new job starts, jobs already
/// running finish and their results are kept.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one batch: `(ordinal, output)` pairs sorted by ordinal, and
/// whether the stop signal cut the batch short.
pub(crate) struct BatchOutput<R> {
    pub results: Vec<(usize, R)>,
    pub cancelled: bool,
}

/// Run `work` over `jobs` on up to `workers` scoped threads.
///
/// Ordinals are the job's position in `jobs`; output order does not depend
/// on which worker finished first.
pub(crate) fn run_batch<T, R, F>(jobs: Vec<T>, workers: usize, stop: &StopSignal, work: F) -> BatchOutput<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let workers = workers.clamp(1, jobs.len().max(1));
    let (job_tx, job_rx) = mpsc::sync_channel::<(usize, T)>(workers);
    let job_rx = Mutex::new(job_rx);
    let (result_tx, result_rx) = mpsc::channel::<(usize, R)>();

    thread::scope(|scope| {
        for id in 0..workers {
            let job_rx = &job_rx;
            let work = &work;
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                loop {
                    let next = match job_rx.lock() {
                        Ok(rx) => rx.recv(),
                        Err(poisoned) => poisoned.into_inner().recv(),
                    };
                    let Ok((ordinal, job)) = next else {
                        break;
                    };
                    if result_tx.send((ordinal, work(job))).is_err() {
                        break;
                    }
                }
                debug!(worker = id, "worker drained");
            });
        }
        drop(result_tx);

        let mut cancelled = false;
        for (ordinal, job) in jobs.into_iter().enumerate() {
            if stop.is_stopped() {
                cancelled = true;
                break;
            }
            if job_tx.send((ordinal, job)).is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut results: Vec<(usize, R)> = result_rx.iter().collect();
        results.sort_by_key(|(ordinal, _)| *ordinal);
        BatchOutput { results, cancelled }
    })
}
