//! Depth-first topological ordering with three-color cycle detection.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

/// Traversal mark of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Result of a successful ordering.
#[derive(Debug, Clone, Default)]
pub struct DepthOrder {
    /// Nodes sorted by `(depth, index)`; dependencies come first.
    pub order: Vec<NodeIndex>,
    /// Longest dependency chain below each node (0 for roots), by node index.
    pub depths: Vec<usize>,
}

impl DepthOrder {
    /// Returns the depth of a node.
    #[must_use]
    pub fn depth(&self, node: NodeIndex) -> usize {
        self.depths.get(node.index()).copied().unwrap_or_default()
    }
}

/// Orders the nodes of `graph` so that every node follows its dependencies.
///
/// An edge `a -> b` means `a` depends on `b`. Nodes and edges are visited in
/// index order, so callers that insert nodes in `(kind, name)` order get a
/// deterministic order and a deterministic cycle report.
///
/// # Errors
///
/// Returns the nodes of the first cycle found, in dependency order,
/// starting from the node the back-edge points to.
pub fn order_by_depth<N, E>(graph: &DiGraph<N, E>) -> std::result::Result<DepthOrder, Vec<NodeIndex>> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut depths = vec![0; graph.node_count()];

    for root in graph.node_indices() {
        if marks[root.index()] != Mark::Unvisited {
            continue;
        }

        let mut path = vec![root];
        let mut stack = vec![(root, sorted_dependencies(graph, root).into_iter())];
        marks[root.index()] = Mark::Visiting;

        while let Some((node, deps)) = stack.last_mut() {
            if let Some(dep) = deps.next() {
                match marks[dep.index()] {
                    Mark::Unvisited => {
                        marks[dep.index()] = Mark::Visiting;
                        path.push(dep);
                        stack.push((dep, sorted_dependencies(graph, dep).into_iter()));
                    }
                    Mark::Visiting => {
                        let start = path.iter().position(|n| *n == dep).unwrap_or_default();
                        return Err(path.split_off(start));
                    }
                    Mark::Done => {}
                }
            } else {
                let node = *node;
                let depth = graph
                    .neighbors_directed(node, Direction::Outgoing)
                    .map(|dep| depths[dep.index()] + 1)
                    .max()
                    .unwrap_or(0);
                depths[node.index()] = depth;
                marks[node.index()] = Mark::Done;
                path.pop();
                stack.pop();
            }
        }
    }

    let mut order: Vec<NodeIndex> = graph.node_indices().collect();
    order.sort_by_key(|node| (depths[node.index()], *node));

    Ok(DepthOrder { order, depths })
}

/// Direct dependencies of a node in index order; petgraph yields them
/// most-recent-edge first.
fn sorted_dependencies<N, E>(graph: &DiGraph<N, E>, node: NodeIndex) -> Vec<NodeIndex> {
    let mut deps: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
    deps.sort_unstable();
    deps.dedup();
    deps
}
