//! The blocking pool.
//!
//! Reactors must never block, so anything that can sleep or wait on I/O
//! is shipped here. Each worker owns a bounded MPMC job queue plus a
//! one-slot park channel; the queue's wake hook unparks the worker on
//! the empty → non-empty transition. Submission hashes a thread-local
//! counter to pick a starting worker and falls through the neighbours,
//! backing off exponentially until a queue accepts the job or the
//! deadline passes. Jobs are not order-preserving.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::queue::{Mpmc, QueueWaker};

type Job = Box<dyn FnOnce() + Send>;

/// Default submission timeout when every worker queue stays full.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-worker job queue capacity.
const WORKER_QUEUE_CAPACITY: usize = 256;

/// Jobs drained per worker batch before rechecking shutdown.
const WORKER_BATCH: usize = 64;

/// How long a worker parks before rechecking shutdown on its own.
const PARK_TIMEOUT: Duration = Duration::from_millis(50);

thread_local! {
    static SUBMIT_SEQ: Cell<u64> = const { Cell::new(0) };
}

/// Aggregate pool counters.
#[derive(Debug, Default)]
pub struct BlockingStats {
    /// Jobs accepted by a worker queue.
    pub submitted: AtomicU64,
    /// Jobs that ran to completion.
    pub completed: AtomicU64,
    /// Jobs that panicked (caught and logged).
    pub panicked: AtomicU64,
    /// Submissions that timed out with every queue full.
    pub rejected: AtomicU64,
}

struct Worker {
    queue: Arc<Mpmc<Job>>,
    unpark: SyncSender<()>,
    thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// A fixed pool of threads for work that is allowed to block.
pub struct BlockingPool {
    workers: Vec<Worker>,
    running: Arc<AtomicBool>,
    stats: Arc<BlockingStats>,
}

impl BlockingPool {
    /// Creates a pool with the default worker count: half the available
    /// cores, at least one.
    #[must_use]
    pub fn start() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self::with_workers((cores / 2).max(1))
    }

    /// Creates a pool with exactly `workers` threads.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero or the OS refuses to spawn a thread.
    #[must_use]
    pub fn with_workers(workers: usize) -> Self {
        assert!(workers > 0, "blocking pool needs at least one worker");
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(BlockingStats::default());

        let workers = (0..workers)
            .map(|i| {
                let (unpark, park): (SyncSender<()>, Receiver<()>) = sync_channel(1);
                let hook = unpark.clone();
                let queue = Arc::new(Mpmc::with_waker(
                    WORKER_QUEUE_CAPACITY,
                    QueueWaker::new(move || {
                        let _ = hook.try_send(());
                    }),
                ));

                let worker_queue = Arc::clone(&queue);
                let worker_running = Arc::clone(&running);
                let worker_stats = Arc::clone(&stats);
                let thread = std::thread::Builder::new()
                    .name(format!("rivulet-blocking-{i}"))
                    .spawn(move || worker_loop(&worker_queue, &park, &worker_running, &worker_stats))
                    .unwrap_or_else(|e| panic!("failed to spawn blocking worker: {e}"));

                Worker {
                    queue,
                    unpark,
                    thread: parking_lot::Mutex::new(Some(thread)),
                }
            })
            .collect();

        Self {
            workers,
            running,
            stats,
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Pool counters.
    #[must_use]
    pub fn stats(&self) -> &BlockingStats {
        &self.stats
    }

    /// Submits a job with the default timeout. Returns false if no
    /// worker accepted it in time.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.spawn_timeout(job, DEFAULT_SUBMIT_TIMEOUT)
    }

    /// Submits a job, retrying across workers until `timeout` expires.
    ///
    /// Returns true once a worker queue accepted the job.
    pub fn spawn_timeout(&self, job: impl FnOnce() + Send + 'static, timeout: Duration) -> bool {
        let mut job: Job = Box::new(job);
        let deadline = Instant::now() + timeout;
        let seq = SUBMIT_SEQ.with(|c| {
            let v = c.get();
            c.set(v.wrapping_add(1));
            v
        });
        let start = fxhash::hash64(&seq) as usize % self.workers.len();

        let mut backoff: u32 = 1;
        loop {
            for i in 0..self.workers.len() {
                let worker = &self.workers[(start + i) % self.workers.len()];
                match worker.queue.push(job) {
                    Ok(()) => {
                        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                    Err(back) => job = back,
                }
            }
            if Instant::now() >= deadline {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(timeout = ?timeout, "blocking pool rejected job, all queues full");
                return false;
            }
            for _ in 0..backoff {
                std::thread::yield_now();
            }
            backoff = (backoff * 2).min(1024);
        }
    }

    /// Stops accepting work, lets the workers drain their queues, and
    /// joins them. Idempotent.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for worker in &self.workers {
            let _ = worker.unpark.try_send(());
        }
        for worker in &self.workers {
            let thread = worker.thread.lock().take();
            if let Some(thread) = thread {
                if thread.join().is_err() {
                    tracing::error!("blocking worker panicked outside a job");
                }
            }
        }
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingPool")
            .field("workers", &self.workers.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn worker_loop(
    queue: &Mpmc<Job>,
    park: &Receiver<()>,
    running: &AtomicBool,
    stats: &BlockingStats,
) {
    tracing::debug!("blocking worker started");
    loop {
        let drained = queue.pop_each(WORKER_BATCH, |job| {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                stats.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!("blocking job panicked");
            } else {
                stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            true
        });
        if drained > 0 {
            continue;
        }
        if !running.load(Ordering::Acquire) {
            if queue.is_empty() {
                break;
            }
            continue;
        }
        let _ = park.recv_timeout(PARK_TIMEOUT);
    }
    tracing::debug!("blocking worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_submitted_jobs() {
        let pool = BlockingPool::with_workers(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let done = Arc::clone(&done);
            assert!(pool.spawn(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 32);
        assert_eq!(pool.stats().completed.load(Ordering::Relaxed), 32);
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let pool = BlockingPool::with_workers(1);
        assert!(pool.spawn(|| panic!("boom")));
        let done = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&done);
        assert!(pool.spawn(move || {
            flag.store(1, Ordering::SeqCst);
        }));
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().panicked.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn submission_times_out_when_saturated() {
        let pool = BlockingPool::with_workers(1);
        let (hold_tx, hold_rx) = sync_channel::<()>(0);
        let (started_tx, started_rx) = sync_channel::<()>(1);
        // Wedge the single worker and wait until it is actually busy.
        assert!(pool.spawn(move || {
            let _ = started_tx.send(());
            let _ = hold_rx.recv();
        }));
        started_rx.recv().unwrap();

        // Fill the queue, then one more must time out.
        for _ in 0..WORKER_QUEUE_CAPACITY {
            if !pool.spawn_timeout(|| {}, Duration::from_millis(1)) {
                break;
            }
        }
        assert!(!pool.spawn_timeout(|| {}, Duration::from_millis(10)));
        assert!(pool.stats().rejected.load(Ordering::Relaxed) >= 1);

        hold_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn default_worker_count_is_positive() {
        let pool = BlockingPool::start();
        assert!(pool.workers() >= 1);
    }
}
