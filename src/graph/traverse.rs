//! Branch iteration and whole-tree traversal.

use crate::graph::TaskNode;
use crate::CrawlError;

/// Applies `visit` to `head` and every node reachable over `next`,
/// skipping the first `skip` nodes. An `Err` from the visitor is logged
/// and iteration continues, so one bad element cannot poison the rest
/// of its chain. Returns the number of nodes visited.
pub fn for_each_on_branch<F>(head: &TaskNode, mut visit: F, skip: usize) -> usize
where
    F: FnMut(&TaskNode) -> Result<(), CrawlError>,
{
    let mut item = Some(head);
    for _ in 0..skip {
        item = item.and_then(TaskNode::next);
    }

    let mut visited = 0;
    while let Some(node) = item {
        if let Err(error) = visit(node) {
            tracing::warn!(level = node.level(), order = node.order(), %error,
                "branch visitor failed, continuing with siblings");
        }
        visited += 1;
        item = node.next();
    }
    visited
}

/// Post-order recursive traversal: `next` first, then `child`, then the
/// node itself. This is the deletion order, also handy for diagnostic
/// enumeration since every node is seen after its whole subtree.
pub fn traverse<F>(head: &TaskNode, visit: &mut F)
where
    F: FnMut(&TaskNode),
{
    if let Some(next) = head.next() {
        traverse(next, visit);
    }
    if let Some(child) = head.child() {
        traverse(child, visit);
    }
    visit(head);
}
