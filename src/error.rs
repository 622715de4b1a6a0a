//! Error types for the converge reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation cycle: configuration and graph construction, state
//! persistence, provider calls, and the reconciliation loop itself.

use std::path::PathBuf;
use thiserror::Error;

use crate::resource::ResourceRef;

/// The main error type for the converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors (fatal, abort planning).
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Reconciliation loop errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration errors.
///
/// Every variant is fatal for the cycle that produced it: planning is
/// aborted and no operation is attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The desired-state file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The desired-state file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    Parse {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    Validation {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Two declared resources share the same identity.
    #[error("Duplicate resource: {resource}")]
    DuplicateResource {
        /// The duplicated identity.
        resource: ResourceRef,
    },

    /// An attribute contains a malformed `${...}` reference.
    #[error("Invalid reference '{reference}' in {resource}")]
    InvalidReference {
        /// Resource holding the attribute.
        resource: ResourceRef,
        /// The raw reference text.
        reference: String,
    },

    /// An attribute holds a value the engine cannot diff or persist.
    #[error("Invalid attribute '{attribute}' in {resource}: {message}")]
    InvalidAttribute {
        /// Resource holding the attribute.
        resource: ResourceRef,
        /// Attribute path, such as `limits.cpu` or `ports[1]`.
        attribute: String,
        /// Why the value was rejected.
        message: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    Cycle {
        /// Nodes of the cycle in dependency order.
        cycle: Vec<ResourceRef>,
    },

    /// A desired resource depends on a resource scheduled for deletion.
    #[error("{resource} depends on {dependency}, which is scheduled for deletion")]
    DanglingDependency {
        /// The dependent resource.
        resource: ResourceRef,
        /// The dependency being deleted.
        dependency: ResourceRef,
    },

    /// A desired resource depends on a resource that exists nowhere.
    #[error("{resource} depends on unknown resource {dependency}")]
    UnresolvedDependency {
        /// The dependent resource.
        resource: ResourceRef,
        /// The missing dependency.
        dependency: ResourceRef,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be serialized.
    #[error("Failed to serialize state: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write error.
        message: String,
    },

    /// Lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State is locked by another process.
    #[error("State is locked by {holder} since {since}")]
    LockedByOther {
        /// Lock holder identifier.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The stored snapshot changed after this writer loaded it.
    #[error("State moved to revision {stored} while planning against revision {base}")]
    StaleRevision {
        /// Revision the writer loaded.
        base: u64,
        /// Revision currently stored.
        stored: u64,
    },
}

/// Errors reported by a provider for a single operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The target system failed in a way that may succeed on retry.
    #[error("Transient failure on {resource}: {message}")]
    Transient {
        /// Resource the operation targeted.
        resource: ResourceRef,
        /// Provider message.
        message: String,
    },

    /// The target system refused the operation.
    #[error("{resource} rejected: {message}")]
    Rejected {
        /// Resource the operation targeted.
        resource: ResourceRef,
        /// Provider message.
        message: String,
    },

    /// The resource does not exist on the target system.
    #[error("{resource} not found on target system")]
    NotFound {
        /// Resource the operation targeted.
        resource: ResourceRef,
    },

    /// The operation exceeded its deadline.
    #[error("Operation on {resource} timed out after {timeout_ms}ms")]
    Timeout {
        /// Resource the operation targeted.
        resource: ResourceRef,
        /// Deadline that was exceeded.
        timeout_ms: u64,
    },
}

/// Retry classification of a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The operation may be retried.
    Retryable,
    /// The operation fails immediately.
    Fatal,
}

/// Reconciliation loop errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The background loop is no longer running.
    #[error("Reconciliation loop has stopped")]
    LoopStopped,

    /// The background loop task terminated abnormally.
    #[error("Reconciliation loop task failed: {message}")]
    TaskFailed {
        /// Description of the failure.
        message: String,
    },

    /// The change-set planned at apply time differs from the confirmed one.
    #[error("Change-set no longer matches the confirmed plan: {reason}; plan again")]
    PlanChanged {
        /// What moved between confirmation and apply.
        reason: String,
    },
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

fn format_cycle(cycle: &[ResourceRef]) -> String {
    let mut parts: Vec<String> = cycle.iter().map(ToString::to_string).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this is a configuration error (cycle, dangling
    /// dependency, invalid document).
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write_failed(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Default classification: transient failures and timeouts are
    /// retryable, everything else is fatal.
    #[must_use]
    pub const fn default_class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => ErrorClass::Retryable,
            Self::Rejected { .. } | Self::NotFound { .. } => ErrorClass::Fatal,
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(resource: ResourceRef, message: impl Into<String>) -> Self {
        Self::Transient {
            resource,
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(resource: ResourceRef, message: impl Into<String>) -> Self {
        Self::Rejected {
            resource,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_closes_the_loop() {
        let err = ConfigError::Cycle {
            cycle: vec![ResourceRef::new("app", "web"), ResourceRef::new("db", "main")],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected: app.web -> db.main -> app.web"
        );
    }

    #[test]
    fn test_default_classification() {
        let r = ResourceRef::new("db", "main");
        assert_eq!(
            ProviderError::transient(r.clone(), "503").default_class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            ProviderError::Timeout { resource: r.clone(), timeout_ms: 10 }.default_class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            ProviderError::rejected(r.clone(), "bad input").default_class(),
            ErrorClass::Fatal
        );
        assert_eq!(ProviderError::NotFound { resource: r }.default_class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_configuration_errors_are_identified() {
        let err: ConvergeError = ConfigError::validation_general("nope").into();
        assert!(err.is_configuration());
        assert!(!ConvergeError::internal("boom").is_configuration());
    }
}
