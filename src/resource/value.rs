//! Attribute values for declared resources.
//!
//! Attributes are loosely typed in desired-state documents, so they are
//! carried as a tagged union with structural equality for diffing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::ResourceRef;

/// Opening marker of an attribute cross-reference.
const REFERENCE_OPEN: &str = "${";

/// Closing marker of an attribute cross-reference.
const REFERENCE_CLOSE: char = '}';

/// A single attribute value.
///
/// Maps are ordered so that equality, hashing and display are
/// deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean value.
    Bool(bool),
    /// Numeric value.
    Number(f64),
    /// String value, possibly containing `${kind.name}` references.
    String(String),
    /// Ordered list of values.
    List(Vec<Self>),
    /// Nested mapping.
    Map(BTreeMap<String, Self>),
}

impl Value {
    /// Returns the string payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the numeric payload, if this is a number.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the boolean payload, if this is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the name of the variant, for messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Returns the path to the first number that is NaN or infinite, relative
    /// to this value (empty for the value itself, `[i]` or `.key` segments
    /// below it).
    ///
    /// Such numbers never compare equal to themselves and do not survive a
    /// JSON round trip, so they are rejected before planning.
    #[must_use]
    pub fn non_finite_path(&self) -> Option<String> {
        match self {
            Self::Number(n) if !n.is_finite() => Some(String::new()),
            Self::List(items) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| item.non_finite_path().map(|path| format!("[{i}]{path}"))),
            Self::Map(entries) => entries
                .iter()
                .find_map(|(key, value)| value.non_finite_path().map(|path| format!(".{key}{path}"))),
            Self::Bool(_) | Self::Number(_) | Self::String(_) => None,
        }
    }

    /// Collects every `${kind.name[.path]}` reference in this value,
    /// descending into lists and maps.
    ///
    /// # Errors
    ///
    /// Returns the raw text of the first malformed reference.
    pub fn references(&self) -> std::result::Result<Vec<ResourceRef>, String> {
        let mut found = Vec::new();
        self.collect_references(&mut found)?;
        Ok(found)
    }

    fn collect_references(&self, found: &mut Vec<ResourceRef>) -> std::result::Result<(), String> {
        match self {
            Self::String(s) => found.extend(parse_references(s)?),
            Self::List(items) => {
                for item in items {
                    item.collect_references(found)?;
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(found)?;
                }
            }
            Self::Bool(_) | Self::Number(_) => {}
        }
        Ok(())
    }
}

/// Extracts the resource references embedded in a string.
fn parse_references(s: &str) -> std::result::Result<Vec<ResourceRef>, String> {
    let mut refs = Vec::new();
    let mut rest = s;

    while let Some(start) = rest.find(REFERENCE_OPEN) {
        let after = &rest[start + REFERENCE_OPEN.len()..];
        let Some(end) = after.find(REFERENCE_CLOSE) else {
            return Err(rest[start..].to_string());
        };

        let inner = after[..end].trim();
        let mut segments = inner.split('.');
        let kind = segments.next().unwrap_or_default();
        let name = segments.next().unwrap_or_default();

        if !ResourceRef::is_valid_identifier(kind) || !ResourceRef::is_valid_identifier(name) {
            return Err(format!("{REFERENCE_OPEN}{inner}{REFERENCE_CLOSE}"));
        }

        refs.push(ResourceRef::new(kind, name));
        rest = &after[end + 1..];
    }

    Ok(refs)
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<Self>> for Value {
    fn from(value: Vec<Self>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<String, Self>> for Value {
    fn from(value: BTreeMap<String, Self>) -> Self {
        Self::Map(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality() {
        let a = Value::List(vec![Value::from(1), Value::from("x")]);
        let b = Value::List(vec![Value::from(1), Value::from("x")]);
        let c = Value::List(vec![Value::from("x"), Value::from(1)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(Value::from(1), Value::from("1"));
    }

    #[test]
    fn test_yaml_scalars_map_to_variants() {
        let parsed: BTreeMap<String, Value> =
            serde_yaml::from_str("port: 5432\nenabled: true\nname: main\ntags: [a, b]\n")
                .unwrap();
        assert_eq!(parsed["port"], Value::Number(5432.0));
        assert_eq!(parsed["enabled"], Value::Bool(true));
        assert_eq!(parsed["name"], Value::from("main"));
        assert_eq!(parsed["tags"].type_name(), "list");
    }

    #[test]
    fn test_null_is_rejected() {
        let parsed: Result<BTreeMap<String, Value>, _> = serde_yaml::from_str("port: ~\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_references_found_in_nested_values() {
        let mut inner = BTreeMap::new();
        inner.insert(
            String::from("url"),
            Value::from("postgres://${database.main.address}:5432"),
        );
        let value = Value::List(vec![Value::Map(inner), Value::from("${network.vpc}")]);

        let refs = value.references().unwrap();
        assert_eq!(
            refs,
            vec![ResourceRef::new("database", "main"), ResourceRef::new("network", "vpc")]
        );
    }

    #[test]
    fn test_malformed_references() {
        assert_eq!(
            Value::from("${database}").references(),
            Err(String::from("${database}"))
        );
        assert!(Value::from("prefix-${database.main").references().is_err());
        assert!(Value::from("no refs here $ {}").references().unwrap().is_empty());
    }
}
