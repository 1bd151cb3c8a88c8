//! Hierarchical JSON for web views.
//!
//! The document has a single `root` node with one child per thread, and each thread's call trees
//! below that:
//!
//! ```json
//! {"name": "root", "value": 180, "children": [
//!   {"name": "P1:T1", "value": 180, "children": [
//!     {"name": "main (app.py)", "value": 180, "children": [...]}
//!   ]}
//! ]}
//! ```
//!
//! `value` is the node's total. A thread's value is the sum of its roots plus whatever its
//! frameless samples measured, so it can exceed the sum of its children.

use std::io;

use serde::Serialize;

use crate::error::Result;
use crate::store::Snapshot;
use crate::tree;

/// Name of the node all threads hang off.
pub const ROOT: &str = "root";

/// A node of the JSON tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Frame label, thread key, or [`ROOT`].
    pub name: String,
    /// Aggregated metric.
    pub value: u64,
    /// Child nodes, in first-seen order.
    pub children: Vec<Node>,
}

impl From<&tree::Node> for Node {
    fn from(node: &tree::Node) -> Self {
        Node {
            name: node.label.clone(),
            value: node.total,
            children: node.children.iter().map(Node::from).collect(),
        }
    }
}

impl From<&Snapshot> for Node {
    fn from(snapshot: &Snapshot) -> Self {
        Node {
            name: snapshot.thread.to_string(),
            value: snapshot
                .tree
                .total()
                .saturating_add(snapshot.tree.empty_time()),
            children: snapshot.tree.roots().iter().map(Node::from).collect(),
        }
    }
}

/// Build the tree for a set of threads.
pub fn tree(snapshots: &[Snapshot]) -> Node {
    let children: Vec<Node> = snapshots.iter().map(Node::from).collect();
    Node {
        name: ROOT.to_string(),
        value: children
            .iter()
            .fold(0u64, |sum, child| sum.saturating_add(child.value)),
        children,
    }
}

/// Write the tree for a set of threads as JSON.
pub fn to_writer<W: io::Write>(snapshots: &[Snapshot], writer: W) -> Result<()> {
    serde_json::to_writer(writer, &tree(snapshots))?;
    Ok(())
}

/// The tree for a set of threads as a JSON string.
pub fn to_string(snapshots: &[Snapshot]) -> Result<String> {
    Ok(serde_json::to_string(&tree(snapshots))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Frame, MetricKind, Metrics, Sample};
    use crate::tree::CallTree;

    #[test]
    fn nested() {
        let mut tree = CallTree::new();
        tree.merge(&[Frame::new("main", "a.py", 1), Frame::new("foo", "a.py", 2)], 7);
        let snapshots = vec![Snapshot {
            thread: "T1".into(),
            tree,
        }];
        assert_eq!(
            to_string(&snapshots).unwrap(),
            r#"{"name":"root","value":7,"children":[{"name":"T1","value":7,"children":[{"name":"main (a.py)","value":7,"children":[{"name":"foo (a.py)","value":7,"children":[]}]}]}]}"#
        );
    }

    #[test]
    fn frameless_samples_count_for_the_thread() {
        let mut tree = CallTree::new();
        tree.merge(&[Frame::new("main", "a.py", 1)], 7);
        tree.add(
            &Sample {
                pid: None,
                tid: "1".into(),
                frames: Vec::new(),
                metrics: Metrics::Single(5),
            },
            MetricKind::WallTime,
        );
        let root = super::tree(&[Snapshot {
            thread: "T1".into(),
            tree,
        }]);
        assert_eq!(root.value, 12);
        assert_eq!(root.children[0].value, 12);
        assert_eq!(root.children[0].children[0].value, 7);
    }

    #[test]
    fn empty() {
        assert_eq!(
            to_string(&[]).unwrap(),
            r#"{"name":"root","value":0,"children":[]}"#
        );
    }
}
