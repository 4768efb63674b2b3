//! Small id-indexed tree used by the statistics serializers.
//!
//! Nodes are stored in a flat arena and addressed by the integer id handed
//! back from `add`, so callers can attach children to any earlier node
//! without holding references into the tree.

/// Visitor for a depth-first traversal.
///
/// `enter_node` fires the first time the traversal reaches a node,
/// `on_node` fires between two consecutive children of the same node, and
/// `exit_node` fires when the traversal leaves it.
pub trait TreeVisitor<T> {
    fn begin(&mut self) {}
    fn enter_node(&mut self, _val: &T, _id: usize) {}
    fn on_node(&mut self, _val: &T, _id: usize) {}
    fn exit_node(&mut self, _val: &T, _id: usize) {}
    fn end(&mut self) {}
}

struct Node<T> {
    val: Option<T>,
    children: Vec<usize>,
}

/// Arena tree with an implicit root. Ids are issued in insertion order;
/// the root holds no value and is never visited.
pub struct Tree<T> {
    nodes: Vec<Node<T>>,
}

const ROOT_ID: usize = 0;

impl<T> Default for Tree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Tree<T> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                val: None,
                children: Vec::new(),
            }],
        }
    }

    /// Add a top-level node.
    pub fn add(&mut self, val: T) -> usize {
        self.add_child(ROOT_ID, val)
    }

    /// Add a node under `parent_id`.
    pub fn add_child(&mut self, parent_id: usize, val: T) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node {
            val: Some(val),
            children: Vec::new(),
        });
        self.nodes[parent_id].children.push(id);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Depth-first traversal in insertion order of children.
    pub fn dfs<V: TreeVisitor<T>>(&self, vis: &mut V) {
        vis.begin();
        self.dfs_node(ROOT_ID, vis);
        vis.end();
    }

    fn dfs_node<V: TreeVisitor<T>>(&self, id: usize, vis: &mut V) {
        let node = &self.nodes[id];
        if let Some(val) = &node.val {
            vis.enter_node(val, id);
        }
        for (i, &child) in node.children.iter().enumerate() {
            self.dfs_node(child, vis);
            if i + 1 != node.children.len()
                && let Some(val) = &node.val
            {
                vis.on_node(val, id);
            }
        }
        if let Some(val) = &node.val {
            vis.exit_node(val, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TraceVisitor {
        trace: Vec<String>,
    }

    impl TreeVisitor<&'static str> for TraceVisitor {
        fn enter_node(&mut self, val: &&'static str, _id: usize) {
            self.trace.push(format!("+{val}"));
        }
        fn on_node(&mut self, val: &&'static str, _id: usize) {
            self.trace.push(format!("|{val}"));
        }
        fn exit_node(&mut self, val: &&'static str, _id: usize) {
            self.trace.push(format!("-{val}"));
        }
    }

    #[test]
    fn test_dfs_order_and_separators() {
        let mut tree = Tree::new();
        let a = tree.add("a");
        tree.add_child(a, "b");
        tree.add_child(a, "c");
        tree.add("d");

        let mut vis = TraceVisitor::default();
        tree.dfs(&mut vis);
        assert_eq!(vis.trace, vec!["+a", "+b", "-b", "|a", "+c", "-c", "-a", "+d", "-d"]);
    }

    #[test]
    fn test_empty_tree() {
        let tree: Tree<i32> = Tree::new();
        assert!(tree.is_empty());
        let mut vis = TraceVisitor::default();
        Tree::<&'static str>::new().dfs(&mut vis);
        assert!(vis.trace.is_empty());
    }

    #[test]
    fn test_deep_chain() {
        let mut tree = Tree::new();
        let mut parent = tree.add("n");
        for _ in 0..4 {
            parent = tree.add_child(parent, "n");
        }
        assert_eq!(tree.len(), 5);
        let mut vis = TraceVisitor::default();
        tree.dfs(&mut vis);
        assert_eq!(vis.trace.len(), 10);
    }
}
