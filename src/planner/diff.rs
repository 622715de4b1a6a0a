//! Diff engine for comparing desired vs observed state.
//!
//! This module computes, per resource, whether the live configuration
//! recorded in observed state matches the declared one.

use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

use crate::config::ConfigHasher;
use crate::graph::DependencyGraph;
use crate::resource::{Resource, ResourceRef, Value};
use crate::state::{ObservedResource, ObservedState};

/// Engine for computing diffs between desired and observed states.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine {
    /// Desired-state hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    /// Resource identity.
    pub resource: ResourceRef,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Attribute-level details.
    pub details: Vec<DiffDetail>,
    /// Hash recorded when the resource was last applied.
    pub old_hash: Option<String>,
    /// Hash of the desired resource.
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// The declared resource changed since it was last applied.
    Update,
    /// The declaration is unchanged but the live attributes diverged.
    Drift,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffDetail {
    /// Attribute that differs.
    pub field: String,
    /// Live value, if any.
    pub old_value: Option<Value>,
    /// Desired value, if any.
    pub new_value: Option<Value>,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Diffs for desired resources in topological order, then deletions.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update (including drift).
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Returns the hash the engine records for a desired resource.
    #[must_use]
    pub fn desired_hash(&self, resource: &Resource) -> String {
        self.hasher.hash_resource(resource)
    }

    /// Computes the diff between the desired graph and observed state.
    #[must_use]
    pub fn compute_diff(&self, graph: &DependencyGraph, observed: &ObservedState) -> DiffResult {
        let mut diffs: Vec<ResourceDiff> = graph
            .resources()
            .map(|desired| self.diff_resource(desired, observed.get(&desired.id())))
            .collect();

        for (id, live) in &observed.resources {
            if !graph.contains(id) {
                debug!("Found orphaned resource: {id}");
                diffs.push(Self::diff_deleted(live));
            }
        }

        let count = |wanted: &[DiffType]| diffs.iter().filter(|d| wanted.contains(&d.diff_type)).count();
        let creates = count(&[DiffType::Create]);
        let updates = count(&[DiffType::Update, DiffType::Drift]);
        let deletes = count(&[DiffType::Delete]);
        let unchanged = count(&[DiffType::NoChange]);

        DiffResult {
            diffs,
            creates,
            updates,
            deletes,
            unchanged,
        }
    }

    /// Computes the diff for a single desired resource.
    #[must_use]
    pub fn diff_resource(&self, desired: &Resource, observed: Option<&ObservedResource>) -> ResourceDiff {
        let new_hash = self.hasher.hash_resource(desired);

        let Some(live) = observed else {
            debug!("{} needs to be created", desired.id());
            return ResourceDiff {
                resource: desired.id(),
                diff_type: DiffType::Create,
                details: vec![],
                old_hash: None,
                new_hash: Some(new_hash),
            };
        };

        let details = Self::compute_detailed_diff(desired, live);
        let hash_changed = live.applied_hash != new_hash;

        let diff_type = match (hash_changed, details.is_empty()) {
            (false, true) => DiffType::NoChange,
            (true, _) => DiffType::Update,
            (false, false) => DiffType::Drift,
        };

        if diff_type != DiffType::NoChange {
            debug!("{} needs update ({diff_type})", desired.id());
        }

        ResourceDiff {
            resource: desired.id(),
            diff_type,
            details,
            old_hash: Some(live.applied_hash.clone()),
            new_hash: Some(new_hash),
        }
    }

    /// Produces the deletion diff for a resource that is no longer declared.
    #[must_use]
    pub fn diff_deleted(live: &ObservedResource) -> ResourceDiff {
        ResourceDiff {
            resource: live.id(),
            diff_type: DiffType::Delete,
            details: vec![],
            old_hash: Some(live.applied_hash.clone()),
            new_hash: None,
        }
    }

    /// Compares declared attributes and dependencies against the live record.
    ///
    /// Live attributes the declaration does not mention are provider-computed
    /// and never count as a difference.
    fn compute_detailed_diff(desired: &Resource, live: &ObservedResource) -> Vec<DiffDetail> {
        let mut details: Vec<DiffDetail> = desired
            .attributes
            .iter()
            .filter(|(key, value)| live.attributes.get(*key) != Some(*value))
            .map(|(key, value)| DiffDetail {
                field: key.clone(),
                old_value: live.attributes.get(key).cloned(),
                new_value: Some(value.clone()),
            })
            .collect();

        let declared_deps = desired
            .all_dependencies()
            .unwrap_or_else(|_| desired.depends_on.clone());
        if declared_deps != live.depends_on {
            details.push(DiffDetail {
                field: String::from("depends_on"),
                old_value: Some(refs_to_value(&live.depends_on)),
                new_value: Some(refs_to_value(&declared_deps)),
            });
        }

        details
    }
}

fn refs_to_value(refs: &BTreeSet<ResourceRef>) -> Value {
    Value::List(refs.iter().map(|r| Value::String(r.to_string())).collect())
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.deletes > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }

    /// Returns the resources whose live attributes drifted.
    #[must_use]
    pub fn drifted(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Drift)
            .collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Drift => "drift",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for DiffDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<Value>| v.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string);
        write!(f, "{}: {} -> {}", self.field, show(&self.old_value), show(&self.new_value))
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.resource, self.diff_type)?;
        if !self.details.is_empty() {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.field)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::state::ObservedAttributes;

    fn db(size: i32) -> Resource {
        Resource::new("database", "main")
            .with_attribute("engine", "postgres")
            .with_attribute("size", size)
    }

    fn applied(resource: &Resource, reported: ObservedAttributes) -> ObservedState {
        let mut state = ObservedState::new("test");
        let hash = DiffEngine::new().desired_hash(resource);
        state.record_applied(resource, reported, &hash);
        state
    }

    #[test]
    fn test_missing_resource_is_created() {
        let diff = DiffEngine::new().diff_resource(&db(1), None);
        assert_eq!(diff.diff_type, DiffType::Create);
        assert!(diff.old_hash.is_none());
    }

    #[test]
    fn test_computed_attributes_are_ignored() {
        let mut reported = ObservedAttributes::new();
        reported.insert(String::from("endpoint"), Value::from("db.internal:5432"));
        let state = applied(&db(1), reported);

        let diff = DiffEngine::new().diff_resource(&db(1), state.get(&db(1).id()));
        assert_eq!(diff.diff_type, DiffType::NoChange);
        assert!(diff.details.is_empty());
    }

    #[test]
    fn test_declared_change_is_an_update_with_details() {
        let state = applied(&db(1), ObservedAttributes::new());

        let diff = DiffEngine::new().diff_resource(&db(2), state.get(&db(2).id()));
        assert_eq!(diff.diff_type, DiffType::Update);
        assert_eq!(
            diff.details,
            vec![DiffDetail {
                field: String::from("size"),
                old_value: Some(Value::from(1)),
                new_value: Some(Value::from(2)),
            }]
        );
    }

    #[test]
    fn test_live_divergence_is_drift() {
        let mut state = applied(&db(1), ObservedAttributes::new());
        let mut live = state.get(&db(1).id()).unwrap().attributes.clone();
        live.insert(String::from("engine"), Value::from("mysql"));
        state.refresh_attributes(&db(1).id(), live);

        let diff = DiffEngine::new().diff_resource(&db(1), state.get(&db(1).id()));
        assert_eq!(diff.diff_type, DiffType::Drift);
        assert_eq!(diff.details[0].field, "engine");
    }

    #[test]
    fn test_compute_diff_counts_and_orphans() {
        let app = Resource::new("app", "web").with_dependency(ResourceRef::new("database", "main"));
        let mut state = applied(&db(1), ObservedAttributes::new());
        state.record_applied(&Resource::new("cache", "old"), ObservedAttributes::new(), "x");

        let graph = GraphBuilder::new().build(vec![db(1), app]).unwrap();
        let result = DiffEngine::new().compute_diff(&graph, &state);

        assert_eq!(result.creates, 1);
        assert_eq!(result.unchanged, 1);
        assert_eq!(result.deletes, 1);
        assert_eq!(result.total_changes(), 2);
        assert_eq!(result.actionable_diffs().len(), 2);
        assert_eq!(result.diffs[2].resource, ResourceRef::new("cache", "old"));
        assert!(result.drifted().is_empty());
    }
}
