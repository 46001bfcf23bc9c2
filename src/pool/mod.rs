//! Fixed-size worker pool with stop-and-export semantics
//!
//! Workers drain one shared queue of boxed jobs. A job can optionally be
//! pinned to a single worker, which is how callers serialize a chain of
//! submissions onto one thread. The pool supports three shutdown shapes:
//! `close`/`join` drains everything, `terminate_detach` signals workers
//! to quit after their current job without waiting, and
//! `join_export_all` stops the workers and hands every job that never
//! started back to the caller, which is how abandoned work survives a
//! stop/restart cycle.
//!
//! A rejected submission (pool already closed) hands the job back in the
//! `Err` value instead of running or dropping it; routing it somewhere
//! useful is the caller's business.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::crawler::worker::LonelyTask;
use crate::lock_ignore_poison;

/// An opaque unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct Pending {
    job: Job,
    /// Worker index this job is pinned to, if any.
    pin: Option<usize>,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Pending>,
    /// No further submissions are accepted.
    closed: bool,
    /// Workers exit after their current job instead of draining.
    terminate: bool,
}

struct PoolShared {
    queue: Mutex<QueueState>,
    available: Condvar,
    /// Jobs currently executing on some worker.
    active: AtomicUsize,
}

/// Names one specific worker thread of a pool. Submissions through the
/// same handle execute sequentially on that worker, in order.
#[derive(Clone, Debug)]
pub struct ThreadDataHandle {
    index: usize,
}

/// A fixed set of worker threads over a shared job queue.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    n_threads: usize,
    round_robin: AtomicUsize,
}

impl ThreadPool {
    /// Spawns `n_threads` workers. A zero count is clamped to one, the
    /// pool is useless otherwise.
    pub fn new(n_threads: usize) -> Self {
        let n_threads = n_threads.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            active: AtomicUsize::new(0),
        });
        let handles = (0..n_threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(index, shared))
            })
            .collect();
        ThreadPool {
            shared,
            handles: Mutex::new(handles),
            n_threads,
            round_robin: AtomicUsize::new(0),
        }
    }

    pub fn threads_count(&self) -> usize {
        self.n_threads
    }

    /// True once the pool stopped accepting work, whether through
    /// `close`, `join`, `terminate_detach` or an export.
    pub fn closed(&self) -> bool {
        lock_ignore_poison(&self.shared.queue).closed
    }

    /// Queued plus currently executing jobs.
    pub fn pending_count(&self) -> usize {
        let queued = lock_ignore_poison(&self.shared.queue).jobs.len();
        queued + self.shared.active.load(Ordering::Acquire)
    }

    /// Picks a worker for pinned submissions, rotating across the pool.
    pub fn get_data_handle(&self) -> ThreadDataHandle {
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.n_threads;
        ThreadDataHandle { index }
    }

    /// Submits one job. The job comes back as `Err` when the pool is
    /// closed.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        self.enqueue(job, None)
    }

    /// Submits one job pinned to the worker named by `handle`.
    pub fn submit_on(&self, handle: &ThreadDataHandle, job: Job) -> Result<(), Job> {
        self.enqueue(job, Some(handle.index % self.n_threads))
    }

    /// Bulk submission: either every job is queued under one lock or,
    /// when the pool is closed, all of them come back untouched.
    pub fn submit_batch(&self, jobs: Vec<Job>) -> Result<(), Vec<Job>> {
        let mut queue = lock_ignore_poison(&self.shared.queue);
        if queue.closed {
            return Err(jobs);
        }
        for job in jobs {
            queue.jobs.push_back(Pending { job, pin: None });
        }
        drop(queue);
        self.shared.available.notify_all();
        Ok(())
    }

    /// Submits a structured task. The action runs with the task's
    /// target node and a fresh copy of the context snapshot.
    pub fn submit_task(&self, task: LonelyTask) -> Result<(), LonelyTask> {
        let pin = task.pin.as_ref().map(|handle| handle.index % self.n_threads);
        let mut queue = lock_ignore_poison(&self.shared.queue);
        if queue.closed {
            return Err(task);
        }
        let job: Job = Box::new(move || task.run());
        queue.jobs.push_back(Pending { job, pin });
        drop(queue);
        self.shared.available.notify_all();
        Ok(())
    }

    fn enqueue(&self, job: Job, pin: Option<usize>) -> Result<(), Job> {
        let mut queue = lock_ignore_poison(&self.shared.queue);
        if queue.closed {
            return Err(job);
        }
        queue.jobs.push_back(Pending { job, pin });
        drop(queue);
        self.shared.available.notify_all();
        Ok(())
    }

    /// Stops intake; workers finish whatever is already queued.
    pub fn close(&self) {
        let mut queue = lock_ignore_poison(&self.shared.queue);
        queue.closed = true;
        drop(queue);
        self.shared.available.notify_all();
    }

    /// Closes and waits for the workers to drain the queue and exit.
    pub fn join(&self) {
        self.close();
        self.join_threads();
    }

    /// Signals workers to exit as soon as possible and does not wait.
    /// Queued jobs are dropped with the pool.
    pub fn terminate_detach(&self) {
        self.request_stop();
        // Dropping the handles detaches the threads.
        lock_ignore_poison(&self.handles).clear();
    }

    /// Stops intake and tells workers to quit after their current job,
    /// without waiting for them. Used by `join_export_all` and by
    /// callers that need `closed()` observable before a deferred join.
    pub fn request_stop(&self) {
        let mut queue = lock_ignore_poison(&self.shared.queue);
        queue.closed = true;
        queue.terminate = true;
        drop(queue);
        self.shared.available.notify_all();
    }

    /// Stops the workers after their current jobs, waits for them to
    /// exit, and delivers every job that never started to `export`.
    pub fn join_export_all<F>(&self, export: F)
    where
        F: FnOnce(Vec<Job>),
    {
        self.request_stop();
        self.join_threads();
        let orphans: Vec<Job> = lock_ignore_poison(&self.shared.queue)
            .jobs
            .drain(..)
            .map(|pending| pending.job)
            .collect();
        export(orphans);
    }

    fn join_threads(&self) {
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *lock_ignore_poison(&self.handles));
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.close();
        self.join_threads();
    }
}

fn worker_loop(index: usize, shared: Arc<PoolShared>) {
    loop {
        let pending = {
            let mut queue = lock_ignore_poison(&shared.queue);
            loop {
                if queue.terminate {
                    return;
                }
                let slot = queue
                    .jobs
                    .iter()
                    .position(|pending| pending.pin.map_or(true, |pin| pin == index));
                if let Some(slot) = slot {
                    let found = queue.jobs.remove(slot);
                    if found.is_some() {
                        // counted as active before the queue lock drops,
                        // so pending_count never under-reports
                        shared.active.fetch_add(1, Ordering::AcqRel);
                    }
                    break found;
                }
                if queue.closed {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };
        let Some(pending) = pending else { continue };

        let outcome = panic::catch_unwind(AssertUnwindSafe(pending.job));
        shared.active.fetch_sub(1, Ordering::AcqRel);
        if outcome.is_err() {
            tracing::error!(worker = index, "job panicked, worker keeps running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_submit_runs_jobs() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            pool.submit(counting_job(&counter))
                .unwrap_or_else(|_| panic!("submit failed"));
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_zero_threads_clamped() {
        let pool = ThreadPool::new(0);
        assert_eq!(pool.threads_count(), 1);
        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(counting_job(&counter))
            .unwrap_or_else(|_| panic!("submit failed"));
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_after_close_hands_job_back() {
        let pool = ThreadPool::new(2);
        pool.close();
        assert!(pool.closed());
        let counter = Arc::new(AtomicUsize::new(0));
        let rejected = pool.submit(counting_job(&counter));
        assert!(rejected.is_err());
        // the rejected job is intact and can run elsewhere
        rejected.unwrap_err()();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_batch_all_or_nothing() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<Job> = (0..8).map(|_| counting_job(&counter)).collect();
        pool.submit_batch(jobs)
            .unwrap_or_else(|_| panic!("submit_batch failed"));
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 8);

        let rejected = pool.submit_batch((0..3).map(|_| counting_job(&counter)).collect());
        assert_eq!(rejected.unwrap_err().len(), 3);
    }

    #[test]
    fn test_pinned_jobs_run_in_order() {
        let pool = ThreadPool::new(4);
        let handle = pool.get_data_handle();
        let log = Arc::new(Mutex::new(Vec::new()));
        for value in 0..64usize {
            let log = Arc::clone(&log);
            pool.submit_on(
                &handle,
                Box::new(move || {
                    log.lock().unwrap().push(value);
                }),
            )
            .unwrap_or_else(|_| panic!("submit_on failed"));
        }
        pool.join();
        let log = log.lock().unwrap();
        assert_eq!(*log, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_join_export_all_returns_unstarted_jobs() {
        // a single worker wedged on a slow job; everything behind it is
        // still queued when the export begins
        let pool = ThreadPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&started);
        pool.submit(Box::new(move || {
            flag.store(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
        }))
        .unwrap_or_else(|_| panic!("submit failed"));
        while started.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        for _ in 0..5 {
            pool.submit(counting_job(&counter))
                .unwrap_or_else(|_| panic!("submit failed"));
        }
        let mut exported = Vec::new();
        pool.join_export_all(|jobs| exported = jobs);
        assert!(pool.closed());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(exported.len(), 5);
        // exported jobs are runnable, exactly once each
        for job in exported {
            job();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_worker_survives_panicking_job() {
        let pool = ThreadPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(Box::new(|| panic!("forced panic")))
            .unwrap_or_else(|_| panic!("submit failed"));
        pool.submit(counting_job(&counter))
            .unwrap_or_else(|_| panic!("submit failed"));
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminate_detach_marks_closed() {
        let pool = ThreadPool::new(2);
        pool.terminate_detach();
        assert!(pool.closed());
        assert!(pool.submit(Box::new(|| {})).is_err());
    }
}
