//! The crawler orchestrator
//!
//! Owns the crawl tree's root, the worker pool and the global link
//! budget. `start` runs the seed page synchronously, turns its links
//! into a first child chain, and ventilates that chain across the pool;
//! from there every worker descends on its own through the work queue.
//! `stop` is non-blocking: it shuts the pool's intake and a detached
//! waiter thread collects every job that never started into a pocket,
//! from which a later `start` on the same root reinjects it. Replacing
//! the root drops the pockets instead, abandoned work of a dead tree is
//! never replayed onto a new one.
//!
//! Nothing here returns errors to the caller; failures surface through
//! the `on_exception` sink and the lifecycle callbacks.

pub mod fetcher;
pub mod worker;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::config::HttpConfig;
use crate::crawler::fetcher::HttpClient;
use crate::crawler::worker::{CallbackSet, LonelyTask, WorkerCtx};
use crate::graph::{LinkBudget, RootHandle, TaskNode, DEFAULT_MAX_NODES};
use crate::lock_ignore_poison;
use crate::pool::{Job, ThreadPool};
use crate::url::Scheme;
use crate::CrawlError;

const DEFAULT_MAX_LINKS: usize = 4096;

/// The public face of the crate: configure callbacks, then `start`.
///
/// `start`, `stop` and `clear` are expected to be driven from one
/// control thread; everything they spawn is synchronized internally.
pub struct Crawler {
    inner: Arc<CrawlerInner>,
}

struct CrawlerInner {
    task_root: Mutex<Option<RootHandle>>,
    pool: Mutex<Arc<ThreadPool>>,
    /// Shared with every node of every tree this crawler starts.
    budget: LinkBudget,
    /// Allocation ceiling installed on fresh roots.
    max_nodes: AtomicU32,
    http_config: HttpConfig,
    callbacks: Mutex<CallbackSet>,
    /// Structured tasks that arrived while the pool was closed.
    lonely_tasks: Mutex<Vec<LonelyTask>>,
    /// Opaque jobs exported from a stopped pool or rejected at intake.
    lonely_functors: Mutex<Vec<Job>>,
}

impl Crawler {
    pub fn new(http_config: HttpConfig) -> Self {
        Crawler {
            inner: Arc::new(CrawlerInner {
                task_root: Mutex::new(None),
                pool: Mutex::new(Arc::new(ThreadPool::new(1))),
                budget: LinkBudget::new(DEFAULT_MAX_LINKS),
                max_nodes: AtomicU32::new(DEFAULT_MAX_NODES),
                http_config,
                callbacks: Mutex::new(CallbackSet::default()),
                lonely_tasks: Mutex::new(Vec::new()),
                lonely_functors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts a crawl from `url`, grepping every page for
    /// `grep_pattern`. When `url` names the tree this crawler already
    /// holds, that tree is resumed instead of rebuilt and pocketed work
    /// is reinjected. Returns false when the crawl could not be set up;
    /// all later failures go through `on_exception`.
    pub fn start(&self, url: &str, grep_pattern: &str, max_links: usize, n_threads: usize) -> bool {
        self.start_with_options(url, grep_pattern, max_links, n_threads, false)
    }

    /// `start`, with the option to re-parse a root that is already done.
    pub fn start_with_options(
        &self,
        url: &str,
        grep_pattern: &str,
        max_links: usize,
        n_threads: usize,
        force_rebuild: bool,
    ) -> bool {
        let n_threads = if n_threads == 0 {
            let fallback = lock_ignore_poison(&self.inner.pool).threads_count();
            tracing::warn!(fallback, "thread count 0 requested, value ignored");
            fallback
        } else {
            n_threads
        };
        let expr = match Regex::new(grep_pattern) {
            Ok(expr) => expr,
            Err(error) => {
                self.inner
                    .report_exception(&format!("invalid grep pattern: {error}"));
                return false;
            }
        };
        self.set_max_links(max_links);

        let existing = lock_ignore_poison(&self.inner.task_root).clone();
        let root = match existing {
            Some(current) if current.grep_vars.target_url() == url => current,
            _ => {
                let fresh = TaskNode::create_root(
                    self.inner.budget.clone(),
                    self.inner.max_nodes.load(Ordering::Acquire),
                );
                fresh.grep_vars.set_target(url.to_string());
                fresh
            }
        };
        root.grep_vars.set_grep_expr(expr);
        self.start_root(root, n_threads, force_rebuild)
    }

    /// The full start sequence against an explicit root handle.
    pub fn start_root(&self, new_root: RootHandle, n_threads: usize, force_rebuild: bool) -> bool {
        let inner = &self.inner;
        let same_root = lock_ignore_poison(&inner.task_root)
            .as_ref()
            .map_or(false, |current| current.same_tree(&new_root));

        if same_root {
            // soft stop: running work finishes, unstarted work is
            // pocketed and reinjected below
            self.stop();
        } else {
            // the old tree's work dies with it
            lock_ignore_poison(&inner.pool).terminate_detach();
            lock_ignore_poison(&inner.lonely_tasks).clear();
            lock_ignore_poison(&inner.lonely_functors).clear();
            inner.budget.reset();
        }

        {
            let mut pool = lock_ignore_poison(&inner.pool);
            if pool.closed() || pool.threads_count() != n_threads {
                *pool = Arc::new(ThreadPool::new(n_threads));
            }
        }

        if same_root {
            let orphans: Vec<Job> = lock_ignore_poison(&inner.lonely_functors).drain(..).collect();
            if !orphans.is_empty() {
                tracing::info!(count = orphans.len(), "reinjecting pocketed jobs");
                let pool = lock_ignore_poison(&inner.pool).clone();
                if let Err(rejected) = pool.submit_batch(orphans) {
                    lock_ignore_poison(&inner.lonely_functors).extend(rejected);
                }
            }
            let parked: Vec<LonelyTask> = lock_ignore_poison(&inner.lonely_tasks).drain(..).collect();
            for task in parked {
                inner.schedule_task(task);
            }
        }

        *lock_ignore_poison(&inner.task_root) = Some(new_root.clone());

        if new_root.grep_vars.is_parsed() && !force_rebuild {
            tracing::debug!("root already parsed, nothing to rebuild");
            return true;
        }

        let mut ctx = match self.make_worker_context(&new_root) {
            Ok(ctx) => ctx,
            Err(error) => {
                inner.report_exception(&format!("cannot build worker context: {error}"));
                return false;
            }
        };

        // The seed page is fetched and parsed on the calling thread;
        // only its children go through the pool.
        worker::grep_one(new_root.node(), &mut ctx);

        let (child, expelled) = new_root.spawn_child();
        drop(expelled);
        let Some(child) = child else {
            return true;
        };
        let spawned = child.spawn_grepped_subtasks(&ctx.host_port, &new_root.grep_vars, 0);
        tracing::info!(spawned, url = %new_root.grep_vars.target_url(), "root page scanned");
        if spawned == 0 {
            drop(new_root.take_child());
            return true;
        }

        if let Some(callback) = &ctx.callbacks.on_node_list_scanned {
            callback(&new_root, new_root.node());
        }
        if let Some(callback) = &ctx.callbacks.on_level_spawned {
            callback(&new_root, child);
        }
        ctx.schedule_branch_exec(child, worker::download_grep_recursive, 0, true);
        true
    }

    /// Suspends the crawl without blocking: intake closes immediately,
    /// a detached waiter joins the workers and parks every job that
    /// never started in the pocket for the next matching `start`.
    pub fn stop(&self) {
        let pool = lock_ignore_poison(&self.inner.pool).clone();
        pool.request_stop();
        let inner = Arc::downgrade(&self.inner);
        thread::spawn(move || {
            pool.join_export_all(|orphans| {
                if orphans.is_empty() {
                    return;
                }
                match inner.upgrade() {
                    Some(inner) => {
                        tracing::debug!(count = orphans.len(), "pocketing unstarted jobs");
                        lock_ignore_poison(&inner.lonely_functors).extend(orphans);
                    }
                    None => tracing::debug!(count = orphans.len(), "crawler gone, dropping jobs"),
                }
            });
        });
    }

    /// Stops the crawl and forgets everything: the tree, the link
    /// counter and both pockets.
    pub fn clear(&self) {
        self.stop();
        *lock_ignore_poison(&self.inner.task_root) = None;
        self.inner.budget.reset();
        lock_ignore_poison(&self.inner.lonely_tasks).clear();
        lock_ignore_poison(&self.inner.lonely_functors).clear();
    }

    /// Resizes the worker pool, draining current work first. A zero
    /// count is rejected with a warning.
    pub fn set_threads_number(&self, n_threads: usize) {
        if n_threads == 0 {
            tracing::warn!("set_threads_number: thread count 0 ignored");
            return;
        }
        let current = lock_ignore_poison(&self.inner.pool).clone();
        if current.threads_count() == n_threads && !current.closed() {
            return;
        }
        // join outside the lock: draining workers may still be routing
        // new tasks through the scheduler, which pockets them now that
        // the pool is closed
        current.join();
        *lock_ignore_poison(&self.inner.pool) = Arc::new(ThreadPool::new(n_threads));
    }

    /// Ceiling on child URLs across the whole tree.
    pub fn set_max_links(&self, max_links: usize) {
        self.inner.budget.set_limit(max_links);
    }

    /// Allocation ceiling installed on roots created from here on, and
    /// applied to the current root if there is one.
    pub fn set_max_nodes(&self, max_nodes: u32) {
        self.inner.max_nodes.store(max_nodes.max(1), Ordering::Release);
        if let Some(root) = self.root() {
            root.set_max_nodes(max_nodes);
        }
    }

    pub fn set_on_single_node_scanned<F>(&self, callback: F)
    where
        F: Fn(&RootHandle, &TaskNode) + Send + Sync + 'static,
    {
        lock_ignore_poison(&self.inner.callbacks).on_single_node_scanned = Some(Arc::new(callback));
    }

    pub fn set_on_node_list_scanned<F>(&self, callback: F)
    where
        F: Fn(&RootHandle, &TaskNode) + Send + Sync + 'static,
    {
        lock_ignore_poison(&self.inner.callbacks).on_node_list_scanned = Some(Arc::new(callback));
    }

    pub fn set_on_level_spawned<F>(&self, callback: F)
    where
        F: Fn(&RootHandle, &TaskNode) + Send + Sync + 'static,
    {
        lock_ignore_poison(&self.inner.callbacks).on_level_spawned = Some(Arc::new(callback));
    }

    pub fn set_on_exception<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        lock_ignore_poison(&self.inner.callbacks).on_exception = Some(Arc::new(callback));
    }

    /// The current crawl tree, if any.
    pub fn root(&self) -> Option<RootHandle> {
        lock_ignore_poison(&self.inner.task_root).clone()
    }

    /// Child URLs spawned so far across the tree.
    pub fn links_count(&self) -> usize {
        self.inner.budget.current()
    }

    pub fn max_links(&self) -> usize {
        self.inner.budget.limit()
    }

    /// Jobs queued or running on the pool right now.
    pub fn pending_jobs(&self) -> usize {
        lock_ignore_poison(&self.inner.pool).pending_count()
    }

    /// Polls the pool until it stays idle, for drivers and tests that
    /// need quiescence. True when idle was reached inside `timeout`.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut quiet_polls = 0;
        while Instant::now() < deadline {
            if self.pending_jobs() == 0 {
                quiet_polls += 1;
                if quiet_polls >= 3 {
                    return true;
                }
            } else {
                quiet_polls = 0;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn make_worker_context(&self, root: &RootHandle) -> Result<WorkerCtx, CrawlError> {
        let client = HttpClient::new(&self.inner.http_config)?;
        let callbacks = lock_ignore_poison(&self.inner.callbacks).clone();
        // Contexts are snapshotted into tasks that may sit in a pocket
        // indefinitely; a weak capture keeps them from holding the
        // crawler alive.
        let task_scheduler = Arc::downgrade(&self.inner);
        let functor_scheduler = Arc::downgrade(&self.inner);
        let handle_source = Arc::downgrade(&self.inner);
        Ok(WorkerCtx {
            client,
            root: root.clone(),
            host_port: String::new(),
            scheme: Scheme::default(),
            callbacks,
            schedule_task: Arc::new(move |task| match task_scheduler.upgrade() {
                Some(inner) => inner.schedule_task(task),
                None => tracing::debug!("crawler gone, dropping task"),
            }),
            schedule_functor: Arc::new(move |job| {
                if let Some(inner) = functor_scheduler.upgrade() {
                    inner.schedule_functor(job);
                }
            }),
            thread_handle: Arc::new(move || {
                handle_source
                    .upgrade()
                    .map(|inner| lock_ignore_poison(&inner.pool).get_data_handle())
            }),
        })
    }
}

impl Default for Crawler {
    fn default() -> Self {
        Crawler::new(HttpConfig::default())
    }
}

impl CrawlerInner {
    /// Submits a structured task, pocketing it when the pool is closed.
    fn schedule_task(&self, task: LonelyTask) {
        let pool = lock_ignore_poison(&self.pool).clone();
        if let Err(parked) = pool.submit_task(task) {
            lock_ignore_poison(&self.lonely_tasks).push(parked);
        }
    }

    /// Submits an opaque job, pocketing it when the pool is closed.
    fn schedule_functor(&self, job: Job) {
        let pool = lock_ignore_poison(&self.pool).clone();
        if let Err(parked) = pool.submit(job) {
            lock_ignore_poison(&self.lonely_functors).push(parked);
        }
    }

    fn report_exception(&self, message: &str) {
        let sink = lock_ignore_poison(&self.callbacks).on_exception.clone();
        match sink {
            Some(sink) => sink(message),
            None => tracing::error!("{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn parsed_root(crawler: &Crawler, url: &str) -> RootHandle {
        let root = TaskNode::create_root(crawler.inner.budget.clone(), 128);
        root.grep_vars.set_target(url.to_string());
        root.grep_vars.publish_ready();
        root.grep_vars.publish_parsed();
        root
    }

    fn counting_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_schedule_pockets_when_pool_is_closed() {
        let crawler = Crawler::default();
        lock_ignore_poison(&crawler.inner.pool).request_stop();

        let counter = Arc::new(AtomicUsize::new(0));
        crawler.inner.schedule_functor(counting_job(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(lock_ignore_poison(&crawler.inner.lonely_functors).len(), 1);
    }

    #[test]
    fn test_restart_same_root_reinjects_pocket_exactly_once() {
        let crawler = Crawler::default();
        let root = parsed_root(&crawler, "http://pocket.test/");
        *lock_ignore_poison(&crawler.inner.task_root) = Some(root.clone());

        let counter = Arc::new(AtomicUsize::new(0));
        lock_ignore_poison(&crawler.inner.lonely_functors).push(counting_job(&counter));

        // the root is already parsed, so this start only manages the
        // pool and the pockets
        assert!(crawler.start_root(root, 2, false));
        assert!(crawler.wait_until_idle(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(lock_ignore_poison(&crawler.inner.lonely_functors).is_empty());

        // a second restart must not run anything again
        let root = crawler.root().unwrap();
        assert!(crawler.start_root(root, 2, false));
        assert!(crawler.wait_until_idle(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replacing_root_drops_the_pocket() {
        let crawler = Crawler::default();
        let old_root = parsed_root(&crawler, "http://old.test/");
        *lock_ignore_poison(&crawler.inner.task_root) = Some(old_root);

        let counter = Arc::new(AtomicUsize::new(0));
        lock_ignore_poison(&crawler.inner.lonely_functors).push(counting_job(&counter));

        let new_root = parsed_root(&crawler, "http://new.test/");
        assert!(crawler.start_root(new_root, 2, false));
        assert!(crawler.wait_until_idle(Duration::from_secs(5)));

        // pocketed work of the old tree never ran on the new pool
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(lock_ignore_poison(&crawler.inner.lonely_functors).is_empty());
    }

    #[test]
    fn test_set_threads_number_zero_is_ignored() {
        let crawler = Crawler::default();
        crawler.set_threads_number(0);
        assert_eq!(lock_ignore_poison(&crawler.inner.pool).threads_count(), 1);
        crawler.set_threads_number(3);
        assert_eq!(lock_ignore_poison(&crawler.inner.pool).threads_count(), 3);
    }

    #[test]
    fn test_clear_resets_budget_and_pockets() {
        let crawler = Crawler::default();
        crawler.inner.budget.try_acquire(7);
        let counter = Arc::new(AtomicUsize::new(0));
        lock_ignore_poison(&crawler.inner.lonely_functors).push(counting_job(&counter));

        crawler.clear();
        assert_eq!(crawler.links_count(), 0);
        assert!(crawler.root().is_none());
        assert!(lock_ignore_poison(&crawler.inner.lonely_functors).is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_rejects_bad_pattern() {
        let crawler = Crawler::default();
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        crawler.set_on_exception(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!crawler.start("http://x.test/", "unclosed [", 16, 2));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(crawler.root().is_none());
    }
}
