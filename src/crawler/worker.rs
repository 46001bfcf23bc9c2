//! Worker-side machinery: the per-action context bundle and the three
//! node actions (download, grep, recursive descent).
//!
//! A [`WorkerCtx`] is a copyable snapshot handed by value into every
//! action: the HTTP handle, the root of the tree being crawled, the
//! lifecycle callbacks, and closures that route new work back through
//! the crawler's scheduler. Actions mutate their own copy (the host and
//! scheme follow whatever the action last connected to) without
//! affecting anyone else's.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::crawler::fetcher::HttpClient;
use crate::graph::{for_each_on_branch, RootHandle, TaskNode};
use crate::pool::{Job, ThreadDataHandle};
use crate::url::{find_closing_quote, find_path_begin, Scheme};

/// A node-processing function submittable to the pool.
pub type NodeAction = fn(&TaskNode, &mut WorkerCtx) -> bool;

/// Lifecycle callback: receives the tree's root handle and the node the
/// event is about.
pub type NodeScanCallback = Arc<dyn Fn(&RootHandle, &TaskNode) + Send + Sync>;

/// Error sink for everything the crawler refuses to fail loudly over.
pub type ExceptionCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The user-settable callbacks, snapshotted into every worker context so
/// the crawler can swap them between crawls without racing in-flight
/// work.
#[derive(Clone, Default)]
pub struct CallbackSet {
    /// Fires once per node, after its page is parsed.
    pub on_single_node_scanned: Option<NodeScanCallback>,
    /// Fires once per sibling chain, after every member was scanned.
    pub on_node_list_scanned: Option<NodeScanCallback>,
    /// Fires once per parent when a new child layer was attached.
    pub on_level_spawned: Option<NodeScanCallback>,
    pub on_exception: Option<ExceptionCallback>,
}

/// A raw node reference that can travel between threads inside a task.
///
/// On its own this is just a pointer; every holder pairs it with a
/// [`RootHandle`] clone, which keeps the whole tree alive until the
/// task is done or dropped.
#[derive(Clone, Copy)]
pub struct NodePtr(*const TaskNode);

// Safety: the pointee is kept alive by the accompanying root handle and
// all shared node state is atomics or mutexes.
unsafe impl Send for NodePtr {}
unsafe impl Sync for NodePtr {}

impl NodePtr {
    pub fn new(node: &TaskNode) -> Self {
        NodePtr(node as *const TaskNode)
    }

    /// # Safety
    ///
    /// The caller must hold a `RootHandle` of the tree the node belongs
    /// to for the whole lifetime of the returned reference.
    pub unsafe fn get<'a>(&self) -> &'a TaskNode {
        &*self.0
    }
}

/// A structured unit of crawl work: run `action` against `target` with
/// a fresh copy of the context snapshot. Carries its root handle so the
/// tree cannot die under a task parked in a pocket.
#[derive(Clone)]
pub struct LonelyTask {
    pub root: RootHandle,
    pub target: NodePtr,
    pub action: NodeAction,
    pub ctx: WorkerCtx,
    /// Present when this task is part of a serialized chain.
    pub pin: Option<ThreadDataHandle>,
}

impl LonelyTask {
    pub fn run(self) {
        let mut ctx = self.ctx.clone();
        // Safety: `self.root` keeps the tree alive, including while the
        // task sat in a pocket between stop and restart.
        let node = unsafe { self.target.get() };
        (self.action)(node, &mut ctx);
    }
}

/// By-value context bundle for one action execution.
#[derive(Clone)]
pub struct WorkerCtx {
    pub client: HttpClient,
    pub root: RootHandle,
    /// `"host[:port]"` of the last successful connect.
    pub host_port: String,
    /// Scheme of the last successful connect.
    pub scheme: Scheme,
    pub callbacks: CallbackSet,
    /// Routes a structured task back through the crawler's scheduler,
    /// which pockets it when the pool is closed.
    pub schedule_task: Arc<dyn Fn(LonelyTask) + Send + Sync>,
    /// Same, for opaque jobs.
    pub schedule_functor: Arc<dyn Fn(Job) + Send + Sync>,
    /// Hands out a pool thread to serialize a chain onto.
    pub thread_handle: Arc<dyn Fn() -> Option<ThreadDataHandle> + Send + Sync>,
}

impl WorkerCtx {
    pub fn report_exception(&self, message: &str) {
        match &self.callbacks.on_exception {
            Some(sink) => sink(message),
            None => tracing::error!("{message}"),
        }
    }

    /// Schedules `action` for every node of the sibling chain starting
    /// at `node`, skipping the first `skip`. With `spray` the tasks land
    /// on whatever workers are free; without it the whole chain is
    /// pinned to a single thread and runs in order. Returns the number
    /// of tasks scheduled.
    pub fn schedule_branch_exec(
        &self,
        node: &TaskNode,
        action: NodeAction,
        skip: usize,
        spray: bool,
    ) -> usize {
        let pin = if spray { None } else { (self.thread_handle)() };
        for_each_on_branch(
            node,
            |item| {
                let task = LonelyTask {
                    root: self.root.clone(),
                    target: NodePtr::new(item),
                    action,
                    ctx: self.clone(),
                    pin: pin.clone(),
                };
                (self.schedule_task)(task);
                Ok(())
            },
            skip,
        )
    }

    /// Schedules an arbitrary functor for every node of the chain.
    pub fn schedule_branch_exec_functor<F>(&self, node: &TaskNode, functor: F, skip: usize) -> usize
    where
        F: Fn(&TaskNode) + Send + Sync + 'static,
    {
        let functor = Arc::new(functor);
        for_each_on_branch(
            node,
            |item| {
                let target = NodePtr::new(item);
                let functor = Arc::clone(&functor);
                let root = self.root.clone();
                let job: Job = Box::new(move || {
                    // Safety: `root` pins the tree for the job's run.
                    functor(unsafe { target.get() });
                    drop(root);
                });
                (self.schedule_functor)(job);
                Ok(())
            },
            skip,
        )
    }
}

/// Downloads the node's target page if it is not already there.
///
/// On success the body and status land in the node and `page_is_ready`
/// goes up. A connect failure or transport error is reported through
/// the exception sink; the node stays not-ready with `response_code` 0
/// and keeps its place in the tree.
pub fn download_one(node: &TaskNode, ctx: &mut WorkerCtx) -> bool {
    if node.grep_vars.is_ready() {
        return true;
    }
    let target_url = node.grep_vars.target_url();
    let Some(host_port) = ctx.client.connect(&target_url) else {
        ctx.report_exception(&format!("connect failed for {target_url}"));
        return false;
    };
    ctx.host_port = host_port;
    ctx.scheme = ctx.client.scheme_buffer();
    node.grep_vars.set_scheme(ctx.scheme);

    let path_begin = find_path_begin(&target_url, target_url.len());
    let path = if path_begin >= target_url.len() {
        "/"
    } else {
        &target_url[path_begin..]
    };
    match ctx.client.issue_request("GET", path) {
        Ok((status, body)) => {
            tracing::debug!(url = %target_url, status, bytes = body.len(), "fetched");
            node.grep_vars.set_response_code(status);
            node.grep_vars.update(|vars| vars.set_page_content(body));
            node.grep_vars.publish_ready();
            true
        }
        Err(error) => {
            ctx.report_exception(&format!("GET {target_url} failed: {error}"));
            false
        }
    }
}

/// Downloads (if needed) and parses one page: fills the URL match
/// vector and the text match vector, raises `page_is_parsed`, and fires
/// the single-node callback. Already-parsed nodes are left alone, which
/// is what makes a restarted crawl skip finished work.
pub fn grep_one(node: &TaskNode, ctx: &mut WorkerCtx) -> bool {
    if node.grep_vars.is_parsed() {
        return true;
    }
    if !download_one(node, ctx) {
        return false;
    }
    node.grep_vars.update(|vars| {
        let url_spans = scan_url_spans(vars.page_content());
        let text_spans: Vec<(usize, usize)> = match vars.grep_expr() {
            Some(expr) => expr
                .find_iter(vars.page_content())
                .map(|found| (found.start(), found.end()))
                .collect(),
            None => Vec::new(),
        };
        vars.set_match_vectors(url_spans, text_spans);
    });
    node.grep_vars.publish_parsed();
    if let Some(callback) = &ctx.callbacks.on_single_node_scanned {
        callback(&ctx.root, node);
    }
    true
}

/// One step of the crawl descent: grep this node, then turn its URL
/// matches into a child chain and push that chain back through the pool.
/// Recursion happens via the work queue, never on the call stack.
pub fn download_grep_recursive(node: &TaskNode, ctx: &mut WorkerCtx) -> bool {
    let scanned = grep_one(node, ctx);
    if scanned && !node.link_budget().exhausted() {
        let (child, expelled) = node.spawn_child();
        // a previous subtree at this slot is deleted right away
        drop(expelled);
        if let Some(child) = child {
            let spawned = child.spawn_grepped_subtasks(&ctx.host_port, &node.grep_vars, 0);
            if spawned == 0 {
                drop(node.take_child());
            } else {
                if let Some(callback) = &ctx.callbacks.on_level_spawned {
                    callback(&ctx.root, child);
                }
                ctx.schedule_branch_exec(child, download_grep_recursive, 0, true);
            }
        }
    }
    note_branch_scan(node, ctx);
    scanned
}

/// Counts this node's scan against its sibling chain and fires the
/// chain callback when the last member reports in.
fn note_branch_scan(node: &TaskNode, ctx: &WorkerCtx) {
    let Some(parent) = node.parent() else {
        return;
    };
    let Some(head) = parent.child() else {
        return;
    };
    // The chain stopped growing before it was scheduled, so its length
    // is stable here.
    let mut chain_len = 0u32;
    let mut item = Some(head);
    while let Some(sibling) = item {
        chain_len += 1;
        item = sibling.next();
    }
    if head.record_branch_scan(chain_len) {
        if let Some(callback) = &ctx.callbacks.on_node_list_scanned {
            callback(&ctx.root, head);
        }
    }
}

static HREF_ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)href\s*=\s*["']?"#).expect("href anchor pattern"));
static SCHEME_ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://").expect("scheme anchor pattern"));

/// Locates URL spans in raw page text: the values of `href` attributes
/// plus bare `http(s)://` runs outside of them. Span ends are found by
/// scanning to the next quote-or-delimiter byte. Returns sorted,
/// non-duplicated `(begin, end)` offsets into `content`.
fn scan_url_spans(content: &str) -> Vec<(usize, usize)> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for anchor in HREF_ANCHOR.find_iter(content) {
        let begin = anchor.end();
        let end = begin + find_closing_quote(&content[begin..]);
        if end > begin {
            spans.push((begin, end));
        }
    }
    for anchor in SCHEME_ANCHOR.find_iter(content) {
        let begin = anchor.start();
        if spans.iter().any(|&(b, e)| b <= begin && begin < e) {
            continue;
        }
        let end = begin + find_closing_quote(&content[begin..]);
        if end > begin {
            spans.push((begin, end));
        }
    }
    spans.sort_unstable();
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::graph::LinkBudget;
    use std::sync::Mutex;

    fn span_texts<'a>(content: &'a str, spans: &[(usize, usize)]) -> Vec<&'a str> {
        spans.iter().map(|&(b, e)| &content[b..e]).collect()
    }

    #[test]
    fn test_scan_quoted_href() {
        let content = r#"<a href="/x">link</a>"#;
        let spans = scan_url_spans(content);
        assert_eq!(span_texts(content, &spans), vec!["/x"]);
    }

    #[test]
    fn test_scan_unquoted_and_spaced_href() {
        let content = r#"<a href = '/a'><a href=/b>"#;
        let spans = scan_url_spans(content);
        assert_eq!(span_texts(content, &spans), vec!["/a", "/b"]);
    }

    #[test]
    fn test_scan_bare_scheme_run() {
        let content = "see https://site.com/page for details";
        let spans = scan_url_spans(content);
        assert_eq!(span_texts(content, &spans), vec!["https://site.com/page"]);
    }

    #[test]
    fn test_scan_does_not_double_count_absolute_href() {
        let content = r#"<a href="http://site.com/a">http://other.com/b"#;
        let spans = scan_url_spans(content);
        assert_eq!(
            span_texts(content, &spans),
            vec!["http://site.com/a", "http://other.com/b"]
        );
    }

    #[test]
    fn test_scan_empty_content() {
        assert!(scan_url_spans("").is_empty());
        assert!(scan_url_spans("no links here").is_empty());
    }

    fn test_ctx(root: &RootHandle, scheduled: Arc<Mutex<Vec<LonelyTask>>>) -> WorkerCtx {
        WorkerCtx {
            client: HttpClient::new(&HttpConfig::default()).unwrap(),
            root: root.clone(),
            host_port: String::new(),
            scheme: Scheme::http(),
            callbacks: CallbackSet::default(),
            schedule_task: Arc::new(move |task| scheduled.lock().unwrap().push(task)),
            schedule_functor: Arc::new(|_job| {}),
            thread_handle: Arc::new(|| None),
        }
    }

    #[test]
    fn test_schedule_branch_exec_covers_the_chain() {
        let root = TaskNode::create_root(LinkBudget::new(64), 128);
        let (child, _) = root.spawn_child();
        let child = child.unwrap();
        child.spawn_next_nodes(3);

        let scheduled = Arc::new(Mutex::new(Vec::new()));
        let ctx = test_ctx(&root, Arc::clone(&scheduled));
        let count = ctx.schedule_branch_exec(child, download_grep_recursive, 0, true);
        assert_eq!(count, 4);
        assert_eq!(scheduled.lock().unwrap().len(), 4);

        let skipped = ctx.schedule_branch_exec(child, download_grep_recursive, 2, true);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn test_grep_one_fails_cleanly_on_bad_target() {
        let root = TaskNode::create_root(LinkBudget::new(64), 128);
        root.grep_vars.set_target("not-a-url".into());
        let scheduled = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = test_ctx(&root, scheduled);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        ctx.callbacks.on_exception = Some(Arc::new(move |msg: &str| {
            sink.lock().unwrap().push(msg.to_string());
        }));

        assert!(!grep_one(root.node(), &mut ctx));
        assert!(!root.grep_vars.is_ready());
        assert_eq!(root.grep_vars.response_code(), 0);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }
}
