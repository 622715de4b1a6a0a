//! Change-set types and construction.
//!
//! This module defines the ordered list of operations a reconciliation run
//! executes, and the [`Planner`] that derives it from a dependency graph
//! and an observed-state snapshot.

use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::config::ConfigHasher;
use crate::error::ConfigError;
use crate::graph::{order_by_depth, DependencyGraph};
use crate::resource::{Resource, ResourceRef};
use crate::state::{ObservedResource, ObservedState};

use super::diff::{DiffDetail, DiffEngine, DiffType, ResourceDiff};

/// An ordered set of operations produced by one planning pass.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeSet {
    /// When the change-set was planned.
    pub created_at: DateTime<Utc>,
    /// Hash of the desired resource set this change-set is based on.
    pub desired_hash: String,
    /// Operations: deletions first, then the rest in topological order.
    pub operations: Vec<Operation>,
}

/// A single planned operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    /// Operation type.
    pub op_type: OperationType,
    /// Target resource: the desired one, or the last observed one for deletes.
    pub resource: Resource,
    /// Reason for this operation.
    pub reason: String,
    /// Attribute-level differences, for updates.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<DiffDetail>,
    /// Indices of earlier operations that must succeed first.
    pub dependencies: Vec<usize>,
    /// Hash to record once the operation succeeds (absent for deletes).
    pub desired_hash: Option<String>,
}

/// Types of operations in a change-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Create a resource that is not observed.
    Create,
    /// Bring an observed resource in line with its declaration.
    Update,
    /// Remove a resource that is no longer declared.
    Delete,
    /// Nothing to do; kept for reporting.
    NoOp,
}

/// Computes change-sets. Planning is a pure function of its inputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct Planner {
    diff: DiffEngine,
    hasher: ConfigHasher,
}

impl Planner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            diff: DiffEngine::new(),
            hasher: ConfigHasher::new(),
        }
    }

    /// Plans the operations that move `observed` towards `graph`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DanglingDependency`] when a desired resource
    /// depends on an observed resource that is no longer declared, and
    /// [`ConfigError::UnresolvedDependency`] when it depends on a resource
    /// that exists nowhere.
    pub fn plan(
        &self,
        graph: &DependencyGraph,
        observed: &ObservedState,
    ) -> std::result::Result<ChangeSet, ConfigError> {
        if let Some((resource, dependency)) = graph.external_dependencies().next() {
            let (resource, dependency) = (resource.clone(), dependency.clone());
            return Err(if observed.contains(&dependency) {
                ConfigError::DanglingDependency { resource, dependency }
            } else {
                ConfigError::UnresolvedDependency { resource, dependency }
            });
        }

        let mut operations = Self::plan_deletes(observed, graph);
        let mut index_of: BTreeMap<ResourceRef, usize> = BTreeMap::new();

        for desired in graph.resources() {
            let id = desired.id();
            let diff = self.diff.diff_resource(desired, observed.get(&id));
            let op_type = OperationType::from(diff.diff_type);

            let dependencies = if op_type == OperationType::NoOp {
                Vec::new()
            } else {
                graph
                    .transitive_dependencies(&id)
                    .iter()
                    .filter_map(|dep| index_of.get(dep).copied())
                    .collect::<BTreeSet<usize>>()
                    .into_iter()
                    .collect()
            };

            if op_type != OperationType::NoOp {
                index_of.insert(id, operations.len());
            }

            operations.push(Operation {
                op_type,
                resource: desired.clone(),
                reason: reason_for(&diff),
                details: diff.details,
                dependencies,
                desired_hash: diff.new_hash,
            });
        }

        let change_set = ChangeSet {
            created_at: Utc::now(),
            desired_hash: self.hasher.hash_resources(graph.resources()),
            operations,
        };

        debug!(
            "Planned change-set: {} create, {} update, {} delete, {} unchanged",
            change_set.create_count(),
            change_set.update_count(),
            change_set.delete_count(),
            change_set.unchanged_count()
        );

        Ok(change_set)
    }

    /// Orders deletions so that dependents go before their dependencies,
    /// using the edges recorded at apply time.
    fn plan_deletes(observed: &ObservedState, graph: &DependencyGraph) -> Vec<Operation> {
        let mut recorded: DiGraph<&ObservedResource, ()> = DiGraph::new();
        let mut index: BTreeMap<&ResourceRef, NodeIndex> = BTreeMap::new();
        for (id, live) in observed.resources.iter().filter(|(id, _)| !graph.contains(id)) {
            index.insert(id, recorded.add_node(live));
        }
        for &node in index.values() {
            let live: &ObservedResource = recorded[node];
            for dep in &live.depends_on {
                if let Some(&target) = index.get(dep) {
                    recorded.add_edge(node, target, ());
                }
            }
        }

        let depth_of: Vec<usize> = match order_by_depth(&recorded) {
            Ok(sorted) => sorted.depths,
            Err(cycle) => {
                warn!(
                    "Recorded dependencies of deleted resources form a cycle ({}); deleting by identity",
                    cycle.iter().map(|n| recorded[*n].id().to_string()).collect::<Vec<_>>().join(", ")
                );
                vec![0; recorded.node_count()]
            }
        };

        // Deepest first; node indices follow identity order.
        let mut order: Vec<NodeIndex> = recorded.node_indices().collect();
        order.sort_by_key(|node| (Reverse(depth_of[node.index()]), *node));

        let mut position = vec![0; recorded.node_count()];
        for (i, node) in order.iter().enumerate() {
            position[node.index()] = i;
        }

        order
            .iter()
            .map(|node| {
                let live = recorded[*node];
                // Wait for every deleted resource that depended on this one.
                let dependencies = recorded
                    .neighbors_directed(*node, Direction::Incoming)
                    .map(|dependent| position[dependent.index()])
                    .collect::<BTreeSet<usize>>()
                    .into_iter()
                    .collect();

                Operation {
                    op_type: OperationType::Delete,
                    resource: live.to_resource(),
                    reason: reason_for(&DiffEngine::diff_deleted(live)),
                    details: Vec::new(),
                    dependencies,
                    desired_hash: None,
                }
            })
            .collect()
    }
}

fn reason_for(diff: &ResourceDiff) -> String {
    let reason = match diff.diff_type {
        DiffType::Create => "declared but not observed",
        DiffType::Update => "declaration changed since last apply",
        DiffType::Drift => "live attributes drifted from declaration",
        DiffType::Delete => "no longer declared",
        DiffType::NoChange => "up to date",
    };
    String::from(reason)
}

impl From<DiffType> for OperationType {
    fn from(diff_type: DiffType) -> Self {
        match diff_type {
            DiffType::Create => Self::Create,
            DiffType::Update | DiffType::Drift => Self::Update,
            DiffType::Delete => Self::Delete,
            DiffType::NoChange => Self::NoOp,
        }
    }
}

impl ChangeSet {
    /// Returns true if there is nothing to apply. No-ops do not count.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.iter().all(|op| !op.is_actionable())
    }

    /// Returns the number of operations, no-ops included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Iterates over operations that change something, with their indices.
    pub fn actionable(&self) -> impl Iterator<Item = (usize, &Operation)> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.is_actionable())
    }

    /// Returns the number of create operations.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(OperationType::Create)
    }

    /// Returns the number of update operations.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(OperationType::Update)
    }

    /// Returns the number of delete operations.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(OperationType::Delete)
    }

    /// Returns the number of resources that need nothing.
    #[must_use]
    pub fn unchanged_count(&self) -> usize {
        self.count(OperationType::NoOp)
    }

    /// Returns the indices of operations that directly depend on `index`.
    #[must_use]
    pub fn dependents_of(&self, index: usize) -> Vec<usize> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.dependencies.contains(&index))
            .map(|(i, _)| i)
            .collect()
    }

    fn count(&self, op_type: OperationType) -> usize {
        self.operations.iter().filter(|op| op.op_type == op_type).count()
    }
}

impl Operation {
    /// Returns the identity of the target resource.
    #[must_use]
    pub fn id(&self) -> ResourceRef {
        self.resource.id()
    }

    /// Returns true unless this is a no-op.
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        self.op_type != OperationType::NoOp
    }

    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.op_type {
            OperationType::Create => format!("Create {}", self.resource),
            OperationType::Update => format!("Update {}", self.resource),
            OperationType::Delete => format!("Delete {}", self.resource),
            OperationType::NoOp => format!("No change for {}", self.resource),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.op_type, self.resource)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Change-set ({} operations):", self.actionable().count())?;
        for (i, op) in self.actionable() {
            write!(f, "  {i}. {op}")?;
            if !op.dependencies.is_empty() {
                let deps: Vec<String> = op.dependencies.iter().map(ToString::to_string).collect();
                write!(f, " after [{}]", deps.join(", "))?;
            }
            writeln!(f)?;
            for detail in &op.details {
                writeln!(f, "       {detail}")?;
            }
        }

        Ok(())
    }
}
