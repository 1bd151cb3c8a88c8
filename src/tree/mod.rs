//! Per-thread call trees.
//!
//! A [`CallTree`] folds the samples of one thread into a forest of [`Node`]s. Each node knows how
//! much of the aggregated metric was spent in it exactly (its *own* value) and in it plus
//! everything it called (its *total*), so that for every node
//!
//! ```text
//! total == own + sum(child.total for child in children)
//! ```
//!
//! Frames are matched against their siblings by [`Frame::label`], so the same function entered
//! from different lines ends up in the same node.

use crate::sample::{Frame, MetricKind, Sample};

/// One aggregated position in a call tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// The label frames are matched by.
    pub label: String,
    /// The first frame that created this node.
    pub frame: Frame,
    /// Metric spent with this node as the innermost frame.
    pub own: u64,
    /// Metric spent in this node and its descendants.
    pub total: u64,
    /// Callees, in the order they were first seen.
    pub children: Vec<Node>,
    /// Whether this node is on the path of the thread's latest sample.
    ///
    /// Only ever set on snapshots.
    pub active: bool,
}

impl Node {
    fn new(frame: &Frame) -> Self {
        Node {
            label: frame.label(),
            frame: frame.clone(),
            own: 0,
            total: 0,
            children: Vec::new(),
            active: false,
        }
    }

    // A linear chain for frames none of which have been seen at this position before.
    fn chain(outer: &[Frame], leaf: &Frame, value: u64) -> Self {
        let mut node = Node::new(leaf);
        node.own = value;
        node.total = value;
        for frame in outer.iter().rev() {
            let mut parent = Node::new(frame);
            parent.total = value;
            parent.children.push(node);
            node = parent;
        }
        node
    }

    /// Visit this node and all its descendants, depth first, with their depth below this node.
    pub fn walk<'a, F>(&'a self, f: &mut F)
    where
        F: FnMut(&'a Node, usize),
    {
        self.walk_at(0, f)
    }

    fn walk_at<'a, F>(&'a self, depth: usize, f: &mut F)
    where
        F: FnMut(&'a Node, usize),
    {
        f(self, depth);
        for child in &self.children {
            child.walk_at(depth + 1, f);
        }
    }
}

/// The aggregated samples of a single thread.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallTree {
    roots: Vec<Node>,
    active: Vec<usize>,
    current: bool,
    samples: u64,
    empty_time: u64,
    idle_time: u64,
}

impl CallTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a sample into the tree, aggregating the metric of the given kind.
    ///
    /// Samples without frames do not create nodes. Their value is only accounted in
    /// [`empty_time`](CallTree::empty_time), and they clear the active path.
    pub fn add(&mut self, sample: &Sample, kind: MetricKind) {
        let value = sample.metrics.value(kind);
        self.samples += 1;
        self.current = true;
        if sample.metrics.is_idle() {
            self.idle_time = self.idle_time.saturating_add(value);
        }
        if sample.frames.is_empty() {
            self.empty_time = self.empty_time.saturating_add(value);
            self.active.clear();
            return;
        }
        self.merge(&sample.frames, value);
    }

    /// Merge a stack, outermost frame first, that was observed with the given value.
    ///
    /// Every node along the stack has its total increased by `value`, and the innermost one its
    /// own value as well. The path taken becomes the active path.
    pub fn merge(&mut self, frames: &[Frame], value: u64) {
        self.active.clear();
        self.current = true;

        let mut siblings = &mut self.roots;
        for (depth, frame) in frames.iter().enumerate() {
            let label = frame.label();
            match siblings.iter().position(|node| node.label == label) {
                Some(i) => {
                    self.active.push(i);
                    let node = &mut siblings[i];
                    node.total = node.total.saturating_add(value);
                    if depth + 1 == frames.len() {
                        node.own = node.own.saturating_add(value);
                    }
                    debug_assert!(node.own <= node.total, "own exceeds total in {}", node.label);
                    siblings = &mut node.children;
                }
                None => {
                    // the rest of the stack is new, so it goes in as a single chain whose nodes
                    // are all first children
                    self.active.push(siblings.len());
                    let last = frames.len() - 1;
                    siblings.push(Node::chain(&frames[depth..last], &frames[last], value));
                    self.active
                        .extend(std::iter::repeat(0).take(frames.len() - depth - 1));
                    break;
                }
            }
        }
    }

    /// The top-level nodes, in the order they were first seen.
    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    /// Child indices leading from [`roots`](CallTree::roots) to the node of the latest sample.
    ///
    /// Empty when nothing has been merged yet or the latest sample had no frames.
    pub fn active_path(&self) -> &[usize] {
        &self.active
    }

    /// Whether a sample has been folded in since the tree was created or last
    /// [`clear_active`](CallTree::clear_active)d.
    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Forget the active path and stop being current, keeping every node and its values.
    pub fn clear_active(&mut self) {
        self.active.clear();
        self.current = false;
    }

    /// The nodes along the active path, outermost first.
    pub fn active_nodes(&self) -> Vec<&Node> {
        let mut nodes = Vec::with_capacity(self.active.len());
        let mut siblings = &self.roots;
        for &i in &self.active {
            match siblings.get(i) {
                Some(node) => {
                    nodes.push(node);
                    siblings = &node.children;
                }
                None => break,
            }
        }
        nodes
    }

    /// A deep copy of this tree with [`Node::active`] set along the active path.
    pub fn snapshot(&self) -> CallTree {
        let mut copy = self.clone();
        let mut siblings = &mut copy.roots;
        for &i in &self.active {
            match siblings.get_mut(i) {
                Some(node) => {
                    node.active = true;
                    siblings = &mut node.children;
                }
                None => break,
            }
        }
        copy
    }

    /// Number of samples folded in, including frameless ones.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Metric of samples that had no frames.
    pub fn empty_time(&self) -> u64 {
        self.empty_time
    }

    /// Metric of samples the sampler flagged as idle.
    pub fn idle_time(&self) -> u64 {
        self.idle_time
    }

    /// Metric spent under any root.
    pub fn total(&self) -> u64 {
        self.roots
            .iter()
            .fold(0u64, |sum, root| sum.saturating_add(root.total))
    }

    /// Whether no sample has been folded in.
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}
