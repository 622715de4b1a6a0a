//! Validation for desired-state documents.
//!
//! This module checks a parsed document for values the engine cannot work
//! with before any graph is built, collecting every problem at once.

use crate::error::{ConfigError, ConvergeError, Result};
use crate::resource::{Resource, ResourceRef};
use std::collections::BTreeSet;
use tracing::debug;

use super::spec::{DesiredStateDocument, EngineSettings, ProjectConfig, ProviderConfig, ProviderKind};

/// Validator for desired-state documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Checks a document and returns every problem found.
    #[must_use]
    pub fn check(&self, document: &DesiredStateDocument) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&document.project, &mut result);
        Self::validate_engine(&document.engine, &mut result);
        Self::validate_provider(&document.provider, &mut result);
        Self::validate_resources(&document.resources, &mut result);

        result
    }

    /// Validates a document.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, document: &DesiredStateDocument) -> Result<ValidationResult> {
        let result = self.check(document);

        match result.errors.first() {
            None => {
                debug!(
                    "Document validation passed with {} warnings",
                    result.warnings.len()
                );
                Ok(result)
            }
            Some(first) => Err(ConvergeError::Config(ConfigError::validation(
                first.message.clone(),
                first.field.clone(),
            ))),
        }
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_engine(engine: &EngineSettings, result: &mut ValidationResult) {
        if engine.max_in_flight == 0 {
            result.error("engine.max_in_flight", "At least one operation must be allowed in flight");
        }

        if engine.operation_timeout_secs == 0 {
            result.error("engine.operation_timeout_secs", "Operation timeout must be at least 1 second");
        }

        if engine.interval_secs == 0 {
            result.error("engine.interval_secs", "Reconcile interval must be at least 1 second");
        }

        let retry = &engine.retry;
        if retry.max_attempts == 0 {
            result.error("engine.retry.max_attempts", "At least one attempt is required");
        }

        if retry.multiplier < 1.0 || !retry.multiplier.is_finite() {
            result.error(
                "engine.retry.multiplier",
                format!("Backoff multiplier must be at least 1.0, got {}", retry.multiplier),
            );
        }

        if retry.initial_backoff_ms > retry.max_backoff_ms {
            result.error(
                "engine.retry.initial_backoff_ms",
                format!(
                    "Initial backoff ({}ms) exceeds max backoff ({}ms)",
                    retry.initial_backoff_ms, retry.max_backoff_ms
                ),
            );
        }

        if engine.max_in_flight > 64 {
            result.warnings.push(format!(
                "engine.max_in_flight: {} concurrent operations may overwhelm the provider",
                engine.max_in_flight
            ));
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        match provider.kind {
            ProviderKind::Http => match provider.url.as_deref() {
                None | Some("") => {
                    result.error("provider.url", "An endpoint URL is required for the http provider");
                }
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    result.error(
                        "provider.url",
                        format!("Provider URL must start with http:// or https://: {url}"),
                    );
                }
                Some(_) => {}
            },
            ProviderKind::Echo => {
                if provider.url.is_some() {
                    result
                        .warnings
                        .push(String::from("provider.url: Ignored by the echo provider"));
                }
            }
        }

        if provider.timeout_secs == 0 {
            result.error("provider.timeout_secs", "Provider timeout must be at least 1 second");
        }
    }

    fn validate_resources(resources: &[Resource], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources declared: every observed resource will be deleted"));
            return;
        }

        let declared: BTreeSet<ResourceRef> = resources.iter().map(Resource::id).collect();
        let mut seen = BTreeSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");
            let id = resource.id();

            if !ResourceRef::is_valid_identifier(&resource.kind) {
                result.error(
                    format!("{prefix}.kind"),
                    format!(
                        "Kind '{}' is invalid. Must be lowercase alphanumeric with '-' or '_'.",
                        resource.kind
                    ),
                );
            }

            if !ResourceRef::is_valid_identifier(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Name '{}' is invalid. Must be lowercase alphanumeric with '-' or '_'.",
                        resource.name
                    ),
                );
            }

            if !seen.insert(id.clone()) {
                result.error(format!("{prefix}.name"), format!("Duplicate resource: {id}"));
            }

            if let Err(ConfigError::InvalidAttribute { attribute, message, .. }) = resource.check_attributes() {
                result.error(
                    format!("{prefix}.attributes.{attribute}"),
                    format!("{id}: {message}"),
                );
            }

            let dependencies = match resource.all_dependencies() {
                Ok(deps) => deps,
                Err(e) => {
                    result.error(format!("{prefix}.attributes"), e.to_string());
                    continue;
                }
            };

            if dependencies.contains(&id) {
                result.error(format!("{prefix}.depends_on"), format!("{id} depends on itself"));
            }

            for dep in dependencies.iter().filter(|dep| !declared.contains(dep)) {
                result.warnings.push(format!(
                    "{prefix}: {id} depends on {dep}, which is not declared in this document"
                ));
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{ProjectConfig, StateConfig};

    fn document(resources: Vec<Resource>) -> DesiredStateDocument {
        DesiredStateDocument {
            project: ProjectConfig {
                name: String::from("shop"),
                environment: String::from("dev"),
            },
            engine: EngineSettings::default(),
            state: StateConfig::default(),
            provider: ProviderConfig::default(),
            resources,
        }
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("shop"));
        assert!(is_valid_name("my-shop-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Shop"));
        assert!(!is_valid_name("123-shop"));
        assert!(!is_valid_name("shop_app"));
        assert!(!is_valid_name("shop-"));
        assert!(!is_valid_name("shop--app"));
    }

    #[test]
    fn test_valid_document_passes() {
        let doc = document(vec![
            Resource::new("database", "main"),
            Resource::new("app", "web").with_attribute("db", "${database.main.url}"),
        ]);
        let result = ConfigValidator::new().validate(&doc).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_collects_every_error() {
        let mut doc = document(vec![
            Resource::new("Database", "main"),
            Resource::new("app", "web"),
            Resource::new("app", "web"),
        ]);
        doc.engine.max_in_flight = 0;
        doc.engine.retry.initial_backoff_ms = 50_000;

        let result = ConfigValidator::new().check(&doc);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "engine.max_in_flight",
                "engine.retry.initial_backoff_ms",
                "resources[0].kind",
                "resources[2].name",
            ]
        );
        assert!(ConfigValidator::new().validate(&doc).is_err());
    }

    #[test]
    fn test_http_provider_requires_url() {
        let mut doc = document(vec![Resource::new("app", "web")]);
        doc.provider.kind = ProviderKind::Http;
        assert_eq!(ConfigValidator::new().check(&doc).error_count(), 1);

        doc.provider.url = Some(String::from("ftp://nope"));
        assert_eq!(ConfigValidator::new().check(&doc).error_count(), 1);

        doc.provider.url = Some(String::from("https://hooks.example.com"));
        assert!(ConfigValidator::new().check(&doc).is_valid());
    }

    #[test]
    fn test_self_dependency_and_bad_reference() {
        let doc = document(vec![
            Resource::new("app", "web").with_dependency(ResourceRef::new("app", "web")),
            Resource::new("app", "api").with_attribute("x", "${broken"),
        ]);
        let result = ConfigValidator::new().check(&doc);
        assert_eq!(result.error_count(), 2);
        assert_eq!(result.errors[0].field, "resources[0].depends_on");
        assert_eq!(result.errors[1].field, "resources[1].attributes");
    }

    #[test]
    fn test_non_finite_numbers_are_rejected_by_path() {
        let yaml = r"
project:
  name: shop
resources:
  - kind: queue
    name: jobs
    attributes:
      limits:
        ratio: .nan
";
        let doc = crate::config::ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let result = ConfigValidator::new().check(&doc);

        assert_eq!(result.error_count(), 1);
        assert_eq!(result.errors[0].field, "resources[0].attributes.limits.ratio");
        assert!(ConfigValidator::new().validate(&doc).is_err());
    }

    #[test]
    fn test_warnings_for_undeclared_dependencies_and_empty_documents() {
        let doc = document(vec![
            Resource::new("app", "web").with_dependency(ResourceRef::new("database", "main")),
        ]);
        let result = ConfigValidator::new().check(&doc);
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);

        let empty = ConfigValidator::new().check(&document(vec![]));
        assert!(empty.is_valid());
        assert_eq!(empty.warning_count(), 1);
    }
}
