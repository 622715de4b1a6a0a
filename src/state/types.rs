//! Observed state types.
//!
//! These types record the last-known live configuration of every managed
//! resource. The planner reads a snapshot; only the executor mutates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::reconciler::{RunStatus, Trigger};
use crate::resource::{Resource, ResourceRef, Value};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept in state.
const MAX_HISTORY: usize = 100;

/// Attributes reported by a provider for a live resource.
pub type ObservedAttributes = BTreeMap<String, Value>;

/// The complete observed state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Monotonic revision, bumped on every mutation.
    pub revision: u64,
    /// Observed resources by identity.
    pub resources: BTreeMap<ResourceRef, ObservedResource>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Reconciliation history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Last-known live configuration of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedResource {
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Live attributes: the applied desired attributes plus anything the
    /// provider reported.
    pub attributes: ObservedAttributes,
    /// Dependencies recorded at apply time, used to order deletions.
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceRef>,
    /// Hash of the desired resource when it was last applied.
    pub applied_hash: String,
    /// State revision at which this resource was last written.
    pub revision: u64,
    /// When the resource was first applied.
    pub created_at: DateTime<Utc>,
    /// When the resource was last applied or refreshed.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the reconciliation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunHistoryEntry {
    /// Run identifier.
    pub run_id: String,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// What started the run.
    pub trigger: Trigger,
    /// Overall outcome.
    pub status: RunStatus,
    /// Hash of the desired state the run planned against.
    pub desired_hash: String,
    /// Resources touched by non-no-op operations.
    pub resources: Vec<String>,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

impl ObservedState {
    /// Creates an empty state.
    #[must_use]
    pub fn new(project: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            revision: 0,
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets an observed resource.
    #[must_use]
    pub fn get(&self, id: &ResourceRef) -> Option<&ObservedResource> {
        self.resources.get(id)
    }

    /// Checks whether a resource is observed.
    #[must_use]
    pub fn contains(&self, id: &ResourceRef) -> bool {
        self.resources.contains_key(id)
    }

    /// Returns the number of observed resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if nothing is observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Iterates over observed identities in `(kind, name)` order.
    pub fn ids(&self) -> impl Iterator<Item = &ResourceRef> {
        self.resources.keys()
    }

    /// Records a successful create or update.
    ///
    /// Live attributes start from the desired attributes and are overlaid
    /// with whatever the provider reported.
    pub fn record_applied(
        &mut self,
        resource: &Resource,
        reported: ObservedAttributes,
        applied_hash: &str,
    ) {
        let now = Utc::now();
        self.revision += 1;

        let mut attributes = resource.attributes.clone();
        attributes.extend(reported);

        let created_at = self
            .resources
            .get(&resource.id())
            .map_or(now, |existing| existing.created_at);

        self.resources.insert(
            resource.id(),
            ObservedResource {
                kind: resource.kind.clone(),
                name: resource.name.clone(),
                attributes,
                depends_on: resource.all_dependencies().unwrap_or_else(|_| resource.depends_on.clone()),
                applied_hash: applied_hash.to_string(),
                revision: self.revision,
                created_at,
                updated_at: now,
            },
        );
        self.last_updated = now;
    }

    /// Replaces the live attributes of a resource after a refresh.
    ///
    /// Returns true if the attributes changed.
    pub fn refresh_attributes(&mut self, id: &ResourceRef, attributes: ObservedAttributes) -> bool {
        let Some(existing) = self.resources.get_mut(id) else {
            return false;
        };
        if existing.attributes == attributes {
            return false;
        }

        self.revision += 1;
        existing.attributes = attributes;
        existing.revision = self.revision;
        existing.updated_at = Utc::now();
        self.last_updated = existing.updated_at;
        true
    }

    /// Removes a resource.
    pub fn remove(&mut self, id: &ResourceRef) -> Option<ObservedResource> {
        let result = self.resources.remove(id);
        if result.is_some() {
            self.revision += 1;
            self.last_updated = Utc::now();
        }
        result
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl ObservedResource {
    /// Returns the identity of this resource.
    #[must_use]
    pub fn id(&self) -> ResourceRef {
        ResourceRef::new(&self.kind, &self.name)
    }

    /// Rebuilds a resource from the observed record, used for deletions.
    #[must_use]
    pub fn to_resource(&self) -> Resource {
        Resource {
            kind: self.kind.clone(),
            name: self.name.clone(),
            attributes: self.attributes.clone(),
            depends_on: self.depends_on.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_applied_merges_reported_attributes() {
        let mut state = ObservedState::new("demo");
        let db = Resource::new("database", "main").with_attribute("engine", "postgres");

        let mut reported = ObservedAttributes::new();
        reported.insert(String::from("address"), Value::from("10.0.0.5"));
        state.record_applied(&db, reported, "hash-1");

        let observed = state.get(&db.id()).unwrap();
        assert_eq!(observed.attributes["engine"], Value::from("postgres"));
        assert_eq!(observed.attributes["address"], Value::from("10.0.0.5"));
        assert_eq!(observed.revision, 1);
        assert_eq!(state.revision, 1);
    }

    #[test]
    fn test_record_applied_keeps_creation_time() {
        let mut state = ObservedState::new("demo");
        let db = Resource::new("database", "main");

        state.record_applied(&db, ObservedAttributes::new(), "hash-1");
        let created = state.get(&db.id()).unwrap().created_at;
        state.record_applied(&db, ObservedAttributes::new(), "hash-2");

        let observed = state.get(&db.id()).unwrap();
        assert_eq!(observed.created_at, created);
        assert_eq!(observed.applied_hash, "hash-2");
        assert_eq!(state.revision, 2);
    }

    #[test]
    fn test_implicit_references_are_recorded_as_dependencies() {
        let mut state = ObservedState::new("demo");
        let app = Resource::new("app", "web").with_attribute("db", "${database.main.url}");
        state.record_applied(&app, ObservedAttributes::new(), "h");

        let observed = state.get(&app.id()).unwrap();
        assert!(observed.depends_on.contains(&ResourceRef::new("database", "main")));
    }

    #[test]
    fn test_remove_and_refresh_bump_revision() {
        let mut state = ObservedState::new("demo");
        let db = Resource::new("database", "main");
        state.record_applied(&db, ObservedAttributes::new(), "h");

        let mut live = ObservedAttributes::new();
        live.insert(String::from("size"), Value::from(2));
        assert!(state.refresh_attributes(&db.id(), live.clone()));
        assert!(!state.refresh_attributes(&db.id(), live));
        assert_eq!(state.revision, 2);

        assert!(state.remove(&db.id()).is_some());
        assert!(state.remove(&db.id()).is_none());
        assert_eq!(state.revision, 3);
        assert!(state.is_empty());
    }

    #[test]
    fn test_state_json_round_trip_keeps_ref_keys() {
        let mut state = ObservedState::new("demo");
        state.record_applied(&Resource::new("database", "main"), ObservedAttributes::new(), "h");

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"database.main\""));
        let back: ObservedState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = ObservedState::new("demo");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(RunHistoryEntry {
                run_id: i.to_string(),
                timestamp: Utc::now(),
                trigger: Trigger::Manual,
                status: RunStatus::Converged,
                desired_hash: String::new(),
                resources: vec![],
                error: None,
            });
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].run_id, "5");
    }
}
