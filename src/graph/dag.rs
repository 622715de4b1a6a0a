//! The desired-state dependency graph.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::resource::{Resource, ResourceRef};

/// Directed acyclic graph over declared resources, backed by petgraph.
///
/// An edge `a -> b` means `a` depends on `b`, so `b` must be applied before
/// `a`. Dependencies on resources outside the declared set are kept aside as
/// external dependencies for the planner to classify.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Declared resources; node indices follow `(kind, name)` order.
    graph: DiGraph<Resource, ()>,
    /// Identity to node index.
    index: HashMap<ResourceRef, NodeIndex>,
    /// Dependencies on resources absent from the declared set.
    external: BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,
    /// Depth of each node, by node index.
    depths: Vec<usize>,
    /// Topological order, ties broken by `(kind, name)` within a depth.
    order: Vec<ResourceRef>,
}

impl DependencyGraph {
    /// Assembles a graph from already-validated parts.
    pub(super) fn from_parts(
        graph: DiGraph<Resource, ()>,
        index: HashMap<ResourceRef, NodeIndex>,
        external: BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,
        depths: Vec<usize>,
        order: &[NodeIndex],
    ) -> Self {
        let order = order.iter().map(|node| graph[*node].id()).collect();
        Self {
            graph,
            index,
            external,
            depths,
            order,
        }
    }

    /// Returns the topological order.
    #[must_use]
    pub fn order(&self) -> &[ResourceRef] {
        &self.order
    }

    /// Iterates over resources in topological order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.order.iter().filter_map(|id| self.get(id))
    }

    /// Gets a resource by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceRef) -> Option<&Resource> {
        self.index.get(id).map(|node| &self.graph[*node])
    }

    /// Checks whether a resource is declared.
    #[must_use]
    pub fn contains(&self, id: &ResourceRef) -> bool {
        self.index.contains_key(id)
    }

    /// Returns the number of declared resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if no resources are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns the direct in-graph dependencies of a resource, sorted.
    #[must_use]
    pub fn dependencies(&self, id: &ResourceRef) -> Vec<ResourceRef> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Returns the resources that directly depend on a resource, sorted.
    #[must_use]
    pub fn dependents(&self, id: &ResourceRef) -> Vec<ResourceRef> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Returns every resource reachable through dependency edges.
    #[must_use]
    pub fn transitive_dependencies(&self, id: &ResourceRef) -> BTreeSet<ResourceRef> {
        let Some(&start) = self.index.get(id) else {
            return BTreeSet::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut found = BTreeSet::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                found.insert(self.graph[node].id());
            }
        }
        found
    }

    /// Returns every resource that depends on `id`, directly or not.
    #[must_use]
    pub fn transitive_dependents(&self, id: &ResourceRef) -> BTreeSet<ResourceRef> {
        let Some(&start) = self.index.get(id) else {
            return BTreeSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut found = BTreeSet::new();
        while let Some(node) = dfs.next(reversed) {
            if node != start {
                found.insert(self.graph[node].id());
            }
        }
        found
    }

    /// Iterates over `(resource, dependency)` pairs whose dependency is not
    /// declared in this graph.
    pub fn external_dependencies(&self) -> impl Iterator<Item = (&ResourceRef, &ResourceRef)> {
        self.external
            .iter()
            .flat_map(|(node, deps)| deps.iter().map(move |dep| (node, dep)))
    }

    /// Returns the depth of a resource (0 for resources without dependencies).
    #[must_use]
    pub fn depth(&self, id: &ResourceRef) -> Option<usize> {
        self.index
            .get(id)
            .and_then(|node| self.depths.get(node.index()))
            .copied()
    }

    /// Groups the topological order into layers of equal depth.
    #[must_use]
    pub fn layers(&self) -> Vec<Vec<ResourceRef>> {
        let mut layers: Vec<Vec<ResourceRef>> = Vec::new();
        for id in &self.order {
            let depth = self.depth(id).unwrap_or_default();
            if layers.len() <= depth {
                layers.resize_with(depth + 1, Vec::new);
            }
            if let Some(layer) = layers.get_mut(depth) {
                layer.push(id.clone());
            }
        }
        layers
    }

    fn neighbors(&self, id: &ResourceRef, direction: Direction) -> Vec<ResourceRef> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let found: BTreeSet<ResourceRef> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].id())
            .collect();
        found.into_iter().collect()
    }
}
