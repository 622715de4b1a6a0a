//! Desired-state document and engine settings.
//!
//! This module defines the structs that map to the `converge.yaml` file.
//! The document fully describes the desired state plus how the engine
//! should drive the target system towards it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resource::{Resource, ResourceRef};

/// The root desired-state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredStateDocument {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineSettings,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Settings that govern planning and execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum number of operations in flight at once.
    pub max_in_flight: usize,
    /// What happens to the rest of the change-set when an operation fails.
    pub failure_policy: FailurePolicy,
    /// Retry behavior for retryable provider errors.
    pub retry: RetrySettings,
    /// Deadline for a single provider call, in seconds.
    pub operation_timeout_secs: u64,
    /// Interval between background reconciliation cycles, in seconds.
    pub interval_secs: u64,
    /// Whether to refresh observed state from the provider before planning.
    pub refresh: bool,
}

/// Failure handling policy for a change-set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip everything depending on the failed operation; independent
    /// branches keep going.
    #[default]
    SkipDependents,
    /// Start nothing new after the first failure.
    AbortRun,
}

/// Retry settings for retryable provider errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per operation, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay between attempts, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor applied to the delay after each retry.
    pub multiplier: f64,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// State directory for the local backend; defaults to `.converge` next
    /// to the configuration file.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// In-process state, lost on exit.
    Memory,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider type.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Endpoint URL (for the http provider).
    #[serde(default)]
    pub url: Option<String>,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

/// Built-in provider types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Acknowledges every operation without touching anything.
    #[default]
    Echo,
    /// Posts operations to a webhook endpoint.
    Http,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

const fn default_provider_timeout() -> u64 {
    30
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            failure_policy: FailurePolicy::default(),
            retry: RetrySettings::default(),
            operation_timeout_secs: 30,
            interval_secs: 60,
            refresh: true,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            url: None,
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl EngineSettings {
    /// Returns the per-operation deadline.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Returns the background reconciliation interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl DesiredStateDocument {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the identities of all declared resources, in document order.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<ResourceRef> {
        self.resources.iter().map(Resource::id).collect()
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SkipDependents => "skip_dependents",
            Self::AbortRun => "abort_run",
        };
        write!(f, "{s}")
    }
}
