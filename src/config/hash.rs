//! Desired-state hashing for change detection.
//!
//! This module provides deterministic hashing of resources and resource sets so
//! that the planner can tell whether a resource changed since it was last
//! applied, and runs can be tagged with the desired state they planned
//! against.

use sha2::{Digest, Sha256};

use crate::resource::{Resource, Value};

/// Hasher for computing desired-state hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a single resource: identity, attributes and
    /// explicit dependencies. Implicit dependencies are covered by the
    /// attribute strings that carry them.
    #[must_use]
    pub fn hash_resource(&self, resource: &Resource) -> String {
        let mut hasher = Sha256::new();

        update_str(&mut hasher, &resource.kind);
        update_str(&mut hasher, &resource.name);

        hasher.update((resource.attributes.len() as u64).to_be_bytes());
        for (key, value) in &resource.attributes {
            update_str(&mut hasher, key);
            update_value(&mut hasher, value);
        }

        hasher.update((resource.depends_on.len() as u64).to_be_bytes());
        for dep in &resource.depends_on {
            update_str(&mut hasher, &dep.kind);
            update_str(&mut hasher, &dep.name);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash over a set of resources, independent of their order.
    #[must_use]
    pub fn hash_resources<'a>(&self, resources: impl IntoIterator<Item = &'a Resource>) -> String {
        let mut hashes: Vec<(String, String)> = resources
            .into_iter()
            .map(|r| (r.id().to_string(), self.hash_resource(r)))
            .collect();
        hashes.sort();

        let mut hasher = Sha256::new();
        for (_, hash) in hashes {
            hasher.update(hash.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

// Length-prefixed so that adjacent fields cannot run together.
fn update_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn update_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Bool(b) => {
            hasher.update([b'b', u8::from(*b)]);
        }
        Value::Number(n) => {
            hasher.update([b'n']);
            hasher.update(n.to_bits().to_be_bytes());
        }
        Value::String(s) => {
            hasher.update([b's']);
            update_str(hasher, s);
        }
        Value::List(items) => {
            hasher.update([b'l']);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                update_value(hasher, item);
            }
        }
        Value::Map(entries) => {
            hasher.update([b'm']);
            hasher.update((entries.len() as u64).to_be_bytes());
            for (key, item) in entries {
                update_str(hasher, key);
                update_value(hasher, item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceRef;

    fn db() -> Resource {
        Resource::new("database", "main")
            .with_attribute("engine", "postgres")
            .with_attribute("size", 2)
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = ConfigHasher::new();
        assert_eq!(hasher.hash_resource(&db()), hasher.hash_resource(&db()));
    }

    #[test]
    fn test_attribute_and_dependency_changes_change_the_hash() {
        let hasher = ConfigHasher::new();
        let base = hasher.hash_resource(&db());

        assert_ne!(base, hasher.hash_resource(&db().with_attribute("size", 3)));
        assert_ne!(
            base,
            hasher.hash_resource(&db().with_dependency(ResourceRef::new("network", "vpc")))
        );
    }

    #[test]
    fn test_value_types_are_distinguished() {
        let hasher = ConfigHasher::new();
        let text = Resource::new("app", "web").with_attribute("replicas", "2");
        let number = Resource::new("app", "web").with_attribute("replicas", 2);
        assert_ne!(hasher.hash_resource(&text), hasher.hash_resource(&number));
    }

    #[test]
    fn test_resource_set_hash_ignores_order() {
        let hasher = ConfigHasher::new();
        let app = Resource::new("app", "web");
        assert_eq!(
            hasher.hash_resources([&db(), &app]),
            hasher.hash_resources([&app, &db()])
        );
    }
}
