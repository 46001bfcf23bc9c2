//! The crawl task graph
//!
//! A tree of [`TaskNode`]s rooted at the seed URL. Tree shape is read
//! without locking: the `next` and `child` slots are atomic pointers,
//! published with release stores and read with acquire loads, and a slot
//! is only ever replaced through [`TaskNode::spawn_child`], which hands
//! the previous subtree back to the caller as an owned [`Subtree`].
//! Every node's page payload lives in [`GrepVars`], written by the one
//! worker that owns the node's fetch and parse phases and observable
//! from other threads once the `page_is_ready` / `page_is_parsed` flags
//! are up.
//!
//! Ownership and safety invariants, which all `unsafe` in this module
//! relies on:
//!
//! - nodes are heap-allocated with `Box::into_raw` and fully initialized
//!   before the release store that publishes them;
//! - a published node is freed only by the recursive deleter, which runs
//!   from the final [`RootHandle`] drop or from a [`Subtree`] drop, and
//!   deletion is externally synchronized (the pool has quiesced, no
//!   concurrent traversal);
//! - an expelled subtree is unreachable from the tree the moment its
//!   `Subtree` is returned, and the `Subtree` shares the tree's
//!   allocation counter, so giving allocations back is safe no matter
//!   when it is dropped.

mod traverse;

pub use traverse::{for_each_on_branch, traverse};

use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::lock_ignore_poison;
use crate::url::{make_full_path, Scheme};
use crate::CrawlError;

/// Allocation ceiling installed on fresh roots. Sized for roughly 2 GB
/// of resident pages at a 200 kB average body.
pub const DEFAULT_MAX_NODES: u32 = 8192;

/// The shared link budget: one pair of atomic counters referenced from
/// every node of a tree. Owned by the crawler, which outlives the trees
/// it hands them to.
#[derive(Clone)]
pub struct LinkBudget {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl LinkBudget {
    pub fn new(max_links: usize) -> Self {
        LinkBudget {
            current: Arc::new(AtomicUsize::new(0)),
            max: Arc::new(AtomicUsize::new(max_links)),
        }
    }

    /// Reserves up to `want` links, returning how many were granted.
    /// The counter never exceeds the limit.
    pub fn try_acquire(&self, want: usize) -> usize {
        let max = self.max.load(Ordering::Acquire);
        let mut granted = 0;
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current >= max {
                    return None;
                }
                granted = want.min(max - current);
                Some(current + granted)
            });
        granted
    }

    /// Returns reserved-but-unused links to the budget.
    pub fn release(&self, count: usize) {
        if count > 0 {
            self.current.fetch_sub(count, Ordering::AcqRel);
        }
    }

    pub fn exhausted(&self) -> bool {
        self.current.load(Ordering::Acquire) >= self.max.load(Ordering::Acquire)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.max.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, max_links: usize) {
        self.max.store(max_links, Ordering::Release);
    }

    pub fn reset(&self) {
        self.current.store(0, Ordering::Release);
    }
}

/// The mutable page payload of one node.
struct GrepState {
    target_url: String,
    scheme: Scheme,
    grep_expr: Option<Regex>,
    page_content: String,
    match_url_vector: Vec<(usize, usize)>,
    match_text_vector: Vec<(usize, usize)>,
}

/// Per-node fetch and parse results.
///
/// The string payload and the match vectors sit behind one uncontended
/// mutex: the owning worker is the only writer during the node's
/// download and parse phases, and readers only take the lock from
/// callbacks. `response_code` and the two publication flags are atomics
/// so progress can be observed without locking. Once `page_is_parsed`
/// reads true, every `(begin, end)` pair in both match vectors indexes
/// into the current `page_content`.
pub struct GrepVars {
    state: Mutex<GrepState>,
    response_code: AtomicU16,
    page_is_ready: AtomicBool,
    page_is_parsed: AtomicBool,
}

impl GrepVars {
    fn new() -> Self {
        GrepVars {
            state: Mutex::new(GrepState {
                target_url: String::new(),
                scheme: Scheme::default(),
                grep_expr: None,
                page_content: String::new(),
                match_url_vector: Vec::new(),
                match_text_vector: Vec::new(),
            }),
            response_code: AtomicU16::new(0),
            page_is_ready: AtomicBool::new(false),
            page_is_parsed: AtomicBool::new(false),
        }
    }

    pub fn target_url(&self) -> String {
        lock_ignore_poison(&self.state).target_url.clone()
    }

    pub fn set_target(&self, url: String) {
        lock_ignore_poison(&self.state).target_url = url;
    }

    pub fn scheme(&self) -> Scheme {
        lock_ignore_poison(&self.state).scheme
    }

    pub fn set_scheme(&self, scheme: Scheme) {
        lock_ignore_poison(&self.state).scheme = scheme;
    }

    pub fn grep_expr(&self) -> Option<Regex> {
        lock_ignore_poison(&self.state).grep_expr.clone()
    }

    pub fn set_grep_expr(&self, expr: Regex) {
        lock_ignore_poison(&self.state).grep_expr = Some(expr);
    }

    /// Last HTTP status, 0 until a response arrived.
    pub fn response_code(&self) -> u16 {
        self.response_code.load(Ordering::Acquire)
    }

    pub fn set_response_code(&self, code: u16) {
        self.response_code.store(code, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.page_is_ready.load(Ordering::Acquire)
    }

    /// Marks `page_content` as fully written. Release store: a thread
    /// that observes the flag also observes the body.
    pub fn publish_ready(&self) {
        self.page_is_ready.store(true, Ordering::Release);
    }

    pub fn is_parsed(&self) -> bool {
        self.page_is_parsed.load(Ordering::Acquire)
    }

    /// Marks both match vectors as fully written.
    pub fn publish_parsed(&self) {
        self.page_is_parsed.store(true, Ordering::Release);
    }

    /// Read access to the locked payload.
    pub fn with_state<R>(&self, read: impl FnOnce(&GrepVarsView<'_>) -> R) -> R {
        let guard = lock_ignore_poison(&self.state);
        read(&GrepVarsView { state: &*guard })
    }

    /// Write access for the owning worker.
    pub(crate) fn update<R>(&self, write: impl FnOnce(&mut GrepVarsUpdate<'_>) -> R) -> R {
        let mut guard = lock_ignore_poison(&self.state);
        write(&mut GrepVarsUpdate {
            state: &mut *guard,
        })
    }

    /// Copies the fields a child node inherits from its parent.
    fn inherit_from(&self, parent: &GrepVars) {
        let (expr, scheme) = {
            let parent_state = lock_ignore_poison(&parent.state);
            (parent_state.grep_expr.clone(), parent_state.scheme)
        };
        let mut state = lock_ignore_poison(&self.state);
        state.grep_expr = expr;
        state.scheme = scheme;
    }
}

/// Borrowed read view over a node's locked payload.
pub struct GrepVarsView<'a> {
    state: &'a GrepState,
}

impl GrepVarsView<'_> {
    pub fn target_url(&self) -> &str {
        &self.state.target_url
    }

    pub fn scheme(&self) -> Scheme {
        self.state.scheme
    }

    pub fn page_content(&self) -> &str {
        &self.state.page_content
    }

    pub fn match_url_vector(&self) -> &[(usize, usize)] {
        &self.state.match_url_vector
    }

    pub fn match_text_vector(&self) -> &[(usize, usize)] {
        &self.state.match_text_vector
    }
}

/// Borrowed write view for the node's owning worker.
pub struct GrepVarsUpdate<'a> {
    state: &'a mut GrepState,
}

impl GrepVarsUpdate<'_> {
    pub fn grep_expr(&self) -> Option<&Regex> {
        self.state.grep_expr.as_ref()
    }

    pub fn page_content(&self) -> &str {
        &self.state.page_content
    }

    pub fn set_page_content(&mut self, body: String) {
        self.state.page_content = body;
    }

    pub fn set_match_vectors(
        &mut self,
        urls: Vec<(usize, usize)>,
        texts: Vec<(usize, usize)>,
    ) {
        self.state.match_url_vector = urls;
        self.state.match_text_vector = texts;
    }
}

/// One node of the crawl tree: a URL, its fetch state and its position
/// among siblings and children.
///
/// `next` points along the sibling chain on the same level, `child` to
/// the head of the next level down. Both are readable from any thread;
/// all other mutation is confined to the worker that owns the node's
/// current phase. Allocation of new nodes always goes through the root,
/// which enforces the ceiling.
pub struct TaskNode {
    level: u32,
    order: u32,
    next: AtomicPtr<TaskNode>,
    child: AtomicPtr<TaskNode>,
    root: AtomicPtr<TaskNode>,
    parent: AtomicPtr<TaskNode>,
    /// Children and siblings spawned through this node.
    child_nodes_count: AtomicU32,
    /// Completed scans among this chain head's siblings, root-chain
    /// bookkeeping for the per-chain callback.
    branch_scans_done: AtomicU32,
    /// Nodes currently alive in this tree, the root included. One cell
    /// shared by every node, so expelled subtrees can give allocations
    /// back no matter when they are dropped.
    allocations: Arc<AtomicU32>,
    /// Root only: allocation ceiling.
    max_nodes: AtomicU32,
    budget: LinkBudget,
    pub grep_vars: GrepVars,
}

impl TaskNode {
    fn new(budget: LinkBudget, allocations: Arc<AtomicU32>) -> Self {
        TaskNode {
            level: 0,
            order: 0,
            next: AtomicPtr::new(ptr::null_mut()),
            child: AtomicPtr::new(ptr::null_mut()),
            root: AtomicPtr::new(ptr::null_mut()),
            parent: AtomicPtr::new(ptr::null_mut()),
            child_nodes_count: AtomicU32::new(0),
            branch_scans_done: AtomicU32::new(0),
            allocations,
            max_nodes: AtomicU32::new(DEFAULT_MAX_NODES),
            budget,
            grep_vars: GrepVars::new(),
        }
    }

    /// Creates a root node and the shared handle that owns the tree.
    /// Dropping the last handle deletes every node recursively.
    pub fn create_root(budget: LinkBudget, max_nodes: u32) -> RootHandle {
        let mut node = Box::new(TaskNode::new(budget, Arc::new(AtomicU32::new(1))));
        node.max_nodes = AtomicU32::new(max_nodes.max(1));
        let raw = Box::into_raw(node);
        // The root's `root` slot points at itself.
        unsafe {
            (*raw).root.store(raw, Ordering::Release);
        }
        RootHandle {
            owner: Arc::new(RootOwner { raw }),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn next(&self) -> Option<&TaskNode> {
        // Safety: published pointers stay valid for the tree's lifetime.
        unsafe { self.next.load(Ordering::Acquire).as_ref() }
    }

    pub fn child(&self) -> Option<&TaskNode> {
        unsafe { self.child.load(Ordering::Acquire).as_ref() }
    }

    pub fn parent(&self) -> Option<&TaskNode> {
        unsafe { self.parent.load(Ordering::Acquire).as_ref() }
    }

    /// The tree's root; the root node returns itself.
    pub fn root(&self) -> &TaskNode {
        match unsafe { self.root.load(Ordering::Acquire).as_ref() } {
            Some(root) => root,
            None => self,
        }
    }

    pub fn is_root(&self) -> bool {
        ptr::eq(self.root(), self)
    }

    pub fn child_count(&self) -> u32 {
        self.child_nodes_count.load(Ordering::Acquire)
    }

    /// Nodes currently alive in this tree.
    pub fn live_nodes(&self) -> u32 {
        self.allocations.load(Ordering::Acquire)
    }

    pub fn max_nodes(&self) -> u32 {
        self.root().max_nodes.load(Ordering::Acquire)
    }

    pub fn set_max_nodes(&self, ceiling: u32) {
        self.root().max_nodes.store(ceiling.max(1), Ordering::Release);
    }

    pub fn link_budget(&self) -> &LinkBudget {
        &self.budget
    }

    /// Allocates a blank node against the root's ceiling. `None` when
    /// the ceiling is reached; never panics on budget grounds.
    fn allocate_node(&self) -> Option<Box<TaskNode>> {
        let root = self.root();
        let max = root.max_nodes.load(Ordering::Acquire);
        let reserved = root
            .allocations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |alive| {
                (alive < max).then_some(alive + 1)
            });
        if reserved.is_err() {
            tracing::warn!(
                alive = root.allocations.load(Ordering::Acquire),
                ceiling = max,
                "node allocation ceiling reached"
            );
            return None;
        }
        let node = Box::new(TaskNode::new(
            root.budget.clone(),
            Arc::clone(&root.allocations),
        ));
        node.root
            .store(root as *const TaskNode as *mut TaskNode, Ordering::Release);
        Some(node)
    }

    /// Creates a child node one level down and publishes it at `child`,
    /// replacing any previous child. The previous subtree, if there was
    /// one, comes back as an owned [`Subtree`] and is freed when the
    /// caller drops it. Returns `(None, None)` when the allocation
    /// ceiling is reached; the existing child is left in place.
    pub fn spawn_child(&self) -> (Option<&TaskNode>, Option<Subtree>) {
        let expelled = self.child.load(Ordering::Acquire);
        let Some(mut node) = self.allocate_node() else {
            return (None, None);
        };
        node.level = self.level + 1;
        node.parent
            .store(self as *const TaskNode as *mut TaskNode, Ordering::Release);
        node.grep_vars.inherit_from(&self.grep_vars);
        node.order = self.child_nodes_count.load(Ordering::Acquire);
        let raw = Box::into_raw(node);
        self.child.store(raw, Ordering::Release);
        self.child_nodes_count.fetch_add(1, Ordering::AcqRel);
        let expelled = (!expelled.is_null()).then(|| Subtree {
            head: expelled,
            allocations: Arc::clone(&self.allocations),
        });
        // Safety: just allocated, fully initialized, owned by the tree.
        (Some(unsafe { &*raw }), expelled)
    }

    /// Detaches and returns the current child subtree, if any.
    pub fn take_child(&self) -> Option<Subtree> {
        let head = self.child.swap(ptr::null_mut(), Ordering::AcqRel);
        (!head.is_null()).then(|| Subtree {
            head,
            allocations: Arc::clone(&self.allocations),
        })
    }

    /// Walks `next` links to the last node of this level.
    pub fn last_on_level(&self) -> &TaskNode {
        let mut item = self;
        while let Some(next) = item.next() {
            item = next;
        }
        item
    }

    /// Appends up to `count` fresh siblings at the end of this node's
    /// level. Each inherits level, parent, root, budget, search pattern
    /// and scheme; `order` is taken from this node's spawn counter at
    /// linkage. Stops early when the allocation ceiling is reached and
    /// returns the number actually appended.
    pub fn spawn_next_nodes(&self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let parent = self.parent.load(Ordering::Acquire);
        let mut last = self.last_on_level();
        let mut spawned = 0;
        while spawned < count {
            let Some(mut node) = self.allocate_node() else {
                break;
            };
            node.level = self.level;
            node.parent.store(parent, Ordering::Release);
            node.grep_vars.inherit_from(&self.grep_vars);
            node.order = self.child_nodes_count.load(Ordering::Acquire);
            let raw = Box::into_raw(node);
            last.next.store(raw, Ordering::Release);
            self.child_nodes_count.fetch_add(1, Ordering::AcqRel);
            // Safety: just published, lives until tree deletion.
            last = unsafe { &*raw };
            spawned += 1;
        }
        spawned
    }

    /// Turns the URL matches of an already-parsed page into a sibling
    /// chain starting at this node: reserves link budget, appends the
    /// missing siblings (this node stands for the first match) and
    /// assigns every chain member its absolute target URL. Returns the
    /// number of URLs actually assigned, which is also what was added
    /// to the shared link counter. No side effects when the source page
    /// is unparsed, matchless, or the budget is spent.
    pub fn spawn_grepped_subtasks(
        &self,
        host_and_port: &str,
        source: &GrepVars,
        skip: usize,
    ) -> usize {
        if !source.is_parsed() {
            return 0;
        }
        let (urls, base_url, scheme) = source.with_state(|vars| {
            let urls: Vec<String> = vars
                .match_url_vector()
                .iter()
                .filter_map(|&(begin, end)| {
                    vars.page_content().get(begin..end).map(str::to_string)
                })
                .collect();
            (urls, vars.target_url().to_string(), vars.scheme())
        });
        if urls.is_empty() {
            return 0;
        }
        let granted = self.budget.try_acquire(urls.len());
        if granted == 0 {
            return 0;
        }
        self.spawn_next_nodes(granted - 1);

        let mut position = 0;
        let mut assigned = 0;
        for_each_on_branch(
            self,
            |node| {
                let Some(short) = urls.get(position).filter(|_| position < granted) else {
                    return Err(CrawlError::Task(
                        "sibling chain is longer than the granted link budget".into(),
                    ));
                };
                let full = make_full_path(short, host_and_port, &base_url, scheme);
                tracing::debug!(url = %full, "spawn");
                node.grep_vars.set_target(full);
                position += 1;
                assigned += 1;
                Ok(())
            },
            skip,
        );
        if assigned < granted {
            // Allocation ceiling cut the chain short; the counter only
            // reflects URLs that really got a node.
            self.budget.release(granted - assigned);
        }
        assigned
    }

    /// Records one completed scan on this chain head. True exactly once,
    /// when the count reaches the chain's length.
    pub fn record_branch_scan(&self, chain_len: u32) -> bool {
        let done = self.branch_scans_done.fetch_add(1, Ordering::AcqRel) + 1;
        done == chain_len
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("level", &self.level)
            .field("order", &self.order)
            .field("url", &self.grep_vars.target_url())
            .field("ready", &self.grep_vars.is_ready())
            .field("parsed", &self.grep_vars.is_parsed())
            .finish()
    }
}

struct RootOwner {
    raw: *mut TaskNode,
}

// Safety: the pointer is owned; all shared access to the pointee goes
// through atomics and mutexes.
unsafe impl Send for RootOwner {}
unsafe impl Sync for RootOwner {}

impl Drop for RootOwner {
    fn drop(&mut self) {
        // Safety: last owner; deletion is externally synchronized.
        unsafe {
            delete_list(self.raw);
        }
    }
}

/// Shared handle to a crawl tree. Clones are cheap; the tree is deleted
/// recursively when the last clone drops.
#[derive(Clone)]
pub struct RootHandle {
    owner: Arc<RootOwner>,
}

impl RootHandle {
    pub fn node(&self) -> &TaskNode {
        // Safety: the owner keeps the allocation alive.
        unsafe { &*self.owner.raw }
    }

    /// Whether two handles refer to the same tree.
    pub fn same_tree(&self, other: &RootHandle) -> bool {
        ptr::eq(self.owner.raw, other.owner.raw)
    }
}

impl Deref for RootHandle {
    type Target = TaskNode;

    fn deref(&self) -> &TaskNode {
        self.node()
    }
}

impl fmt::Debug for RootHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RootHandle").field(self.node()).finish()
    }
}

/// An expelled subtree: nodes that were unlinked from the tree and are
/// now owned by whoever holds this value. Dropping it frees every node
/// and gives their allocations back to the tree's counter.
pub struct Subtree {
    head: *mut TaskNode,
    allocations: Arc<AtomicU32>,
}

// Safety: exclusive ownership of the unlinked nodes.
unsafe impl Send for Subtree {}

impl Subtree {
    pub fn head(&self) -> &TaskNode {
        // Safety: owned, alive until drop.
        unsafe { &*self.head }
    }
}

impl Drop for Subtree {
    fn drop(&mut self) {
        // Safety: these nodes are unreachable from the tree and this is
        // their sole owner.
        let freed = unsafe { delete_list(self.head) };
        self.allocations.fetch_sub(freed as u32, Ordering::AcqRel);
    }
}

/// Frees a subtree post-order (`next`, then `child`, then the node) and
/// returns how many nodes were freed.
///
/// # Safety
///
/// `head` must be null or a tree pointer this caller exclusively owns,
/// with no concurrent traversal anywhere in it.
unsafe fn delete_list(head: *mut TaskNode) -> usize {
    if head.is_null() {
        return 0;
    }
    let next = (*head).next.load(Ordering::Acquire);
    let child = (*head).child.load(Ordering::Acquire);
    let mut freed = delete_list(next);
    freed += delete_list(child);
    drop(Box::from_raw(head));
    freed + 1
}
