//! Declared resource types.
//!
//! A [`Resource`] is one node of the desired-state graph. Its identity is
//! the `(kind, name)` pair carried by [`ResourceRef`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::ConfigError;

use super::value::Value;

/// Reference to a resource by identity.
///
/// Ordering is lexicographic by `(kind, name)`, which is the tie-breaking
/// order used throughout planning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceRef {
    /// Resource kind (e.g. `database`, `dns_record`).
    pub kind: String,
    /// Resource name, unique within its kind.
    pub name: String,
}

/// A declared desired-state resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Desired attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceRef>,
}

impl ResourceRef {
    /// Creates a new reference.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Parses a `kind.name` reference.
    ///
    /// # Errors
    ///
    /// Returns an error if either segment is missing or malformed.
    pub fn parse(s: &str) -> std::result::Result<Self, ConfigError> {
        let invalid = || {
            ConfigError::validation_general(format!(
                "Invalid resource reference '{s}'. Expected 'kind.name'."
            ))
        };

        let (kind, name) = s.split_once('.').ok_or_else(invalid)?;
        if !Self::is_valid_identifier(kind) || !Self::is_valid_identifier(name) {
            return Err(invalid());
        }

        Ok(Self::new(kind, name))
    }

    /// Checks that a kind or name is lowercase alphanumeric with `-` or `_`,
    /// starting with an alphanumeric character.
    #[must_use]
    pub fn is_valid_identifier(s: &str) -> bool {
        let mut chars = s.chars();
        let Some(first) = chars.next() else {
            return false;
        };

        (first.is_ascii_lowercase() || first.is_ascii_digit())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    }
}

impl TryFrom<String> for ResourceRef {
    type Error = ConfigError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceRef> for String {
    fn from(value: ResourceRef) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl Resource {
    /// Creates a resource with no attributes and no dependencies.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
            depends_on: BTreeSet::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, dependency: ResourceRef) -> Self {
        self.depends_on.insert(dependency);
        self
    }

    /// Returns the identity of this resource.
    #[must_use]
    pub fn id(&self) -> ResourceRef {
        ResourceRef::new(&self.kind, &self.name)
    }

    /// Scans attribute values for `${kind.name}` references.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidReference`] for a malformed reference.
    pub fn implicit_references(&self) -> std::result::Result<BTreeSet<ResourceRef>, ConfigError> {
        let mut refs = BTreeSet::new();
        for value in self.attributes.values() {
            let found = value.references().map_err(|reference| ConfigError::InvalidReference {
                resource: self.id(),
                reference,
            })?;
            refs.extend(found);
        }
        Ok(refs)
    }

    /// Rejects attribute values holding NaN or infinite numbers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAttribute`] naming the first offending
    /// attribute path.
    pub fn check_attributes(&self) -> std::result::Result<(), ConfigError> {
        let offending = self
            .attributes
            .iter()
            .find_map(|(key, value)| value.non_finite_path().map(|path| format!("{key}{path}")));
        match offending {
            Some(attribute) => Err(ConfigError::InvalidAttribute {
                resource: self.id(),
                attribute,
                message: String::from("numbers must be finite"),
            }),
            None => Ok(()),
        }
    }

    /// Returns explicit and implicit dependencies combined.
    ///
    /// # Errors
    ///
    /// Returns an error if an attribute holds a malformed reference.
    pub fn all_dependencies(&self) -> std::result::Result<BTreeSet<ResourceRef>, ConfigError> {
        let mut deps = self.implicit_references()?;
        deps.extend(self.depends_on.iter().cloned());
        Ok(deps)
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_parse_and_display() {
        let r = ResourceRef::parse("dns_record.api").unwrap();
        assert_eq!(r, ResourceRef::new("dns_record", "api"));
        assert_eq!(r.to_string(), "dns_record.api");

        assert!(ResourceRef::parse("nodot").is_err());
        assert!(ResourceRef::parse("a.b.c").is_err());
        assert!(ResourceRef::parse("Kind.name").is_err());
        assert!(ResourceRef::parse(".name").is_err());
    }

    #[test]
    fn test_ref_ordering_is_kind_then_name() {
        let mut refs = vec![
            ResourceRef::new("b", "a"),
            ResourceRef::new("a", "z"),
            ResourceRef::new("a", "b"),
        ];
        refs.sort();
        assert_eq!(
            refs,
            vec![
                ResourceRef::new("a", "b"),
                ResourceRef::new("a", "z"),
                ResourceRef::new("b", "a"),
            ]
        );
    }

    #[test]
    fn test_ref_serializes_as_string() {
        let json = serde_json::to_string(&ResourceRef::new("db", "main")).unwrap();
        assert_eq!(json, "\"db.main\"");
        let back: ResourceRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ResourceRef::new("db", "main"));
    }

    #[test]
    fn test_all_dependencies_merges_explicit_and_implicit() {
        let app = Resource::new("app", "web")
            .with_attribute("db_url", "${db.main.url}")
            .with_dependency(ResourceRef::new("network", "vpc"));

        let deps = app.all_dependencies().unwrap();
        assert!(deps.contains(&ResourceRef::new("db", "main")));
        assert!(deps.contains(&ResourceRef::new("network", "vpc")));
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn test_invalid_reference_names_the_resource() {
        let app = Resource::new("app", "web").with_attribute("db_url", "${db}");
        let err = app.implicit_references().unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidReference {
                resource: ResourceRef::new("app", "web"),
                reference: String::from("${db}"),
            }
        );
    }
}
