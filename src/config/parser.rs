//! Configuration parser for loading desired-state documents.
//!
//! This module handles loading the document from YAML files and applying
//! environment variable overrides, with proper precedence and error
//! handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::DesiredStateDocument;

/// Environment variable holding the project name override.
pub const ENV_PROJECT_NAME: &str = "CONVERGE_PROJECT_NAME";
/// Environment variable holding the environment override.
pub const ENV_ENVIRONMENT: &str = "CONVERGE_ENVIRONMENT";
/// Environment variable holding the concurrency override.
pub const ENV_MAX_IN_FLIGHT: &str = "CONVERGE_MAX_IN_FLIGHT";
/// Environment variable holding the reconcile interval override.
pub const ENV_INTERVAL_SECS: &str = "CONVERGE_INTERVAL_SECS";
/// Environment variable holding the state file path override.
pub const ENV_STATE_PATH: &str = "CONVERGE_STATE_PATH";
/// Environment variable holding the provider URL override.
pub const ENV_PROVIDER_URL: &str = "CONVERGE_PROVIDER_URL";

/// Parser for desired-state documents.
#[derive(Debug, Clone, Default)]
pub struct ConfigParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a document from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DesiredStateDocument> {
        let path = path.as_ref();
        info!("Loading desired state from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::Parse {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a document from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DesiredStateDocument> {
        debug!("Parsing YAML document");

        let document: DesiredStateDocument = serde_yaml::from_str(content).map_err(|e| {
            let location = source
                .map(|p| p.display().to_string())
                .or_else(|| e.location().map(|l| format!("line {}, column {}", l.line(), l.column())));
            ConvergeError::Config(ConfigError::Parse {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed document for project {} with {} resources",
            document.project.name,
            document.resources.len()
        );
        Ok(document)
    }

    /// Loads a document and applies environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// override holds a malformed number.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DesiredStateDocument> {
        let mut document = self.load_file(path)?;
        Self::apply_overrides(&mut document, |name| std::env::var(name).ok())?;
        Ok(document)
    }

    /// Applies `CONVERGE_*` overrides, reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric override cannot be parsed.
    pub fn apply_overrides(
        document: &mut DesiredStateDocument,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(name) = lookup(ENV_PROJECT_NAME) {
            debug!("Overriding project.name from environment");
            document.project.name = name;
        }

        if let Some(env) = lookup(ENV_ENVIRONMENT) {
            debug!("Overriding project.environment from environment");
            document.project.environment = env;
        }

        if let Some(raw) = lookup(ENV_MAX_IN_FLIGHT) {
            debug!("Overriding engine.max_in_flight from environment");
            document.engine.max_in_flight = parse_number(ENV_MAX_IN_FLIGHT, &raw)?;
        }

        if let Some(raw) = lookup(ENV_INTERVAL_SECS) {
            debug!("Overriding engine.interval_secs from environment");
            document.engine.interval_secs = parse_number(ENV_INTERVAL_SECS, &raw)?;
        }

        if let Some(path) = lookup(ENV_STATE_PATH) {
            debug!("Overriding state.path from environment");
            document.state.path = Some(path);
        }

        if let Some(url) = lookup(ENV_PROVIDER_URL) {
            debug!("Overriding provider.url from environment");
            document.provider.url = Some(url);
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::Parse {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        ConvergeError::Config(ConfigError::validation(
            format!("{name} must be a non-negative integer, got '{raw}'"),
            name,
        ))
    })
}

/// Default document file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml", "desired.yaml"];

/// Finds the desired-state document in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no document is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found desired-state file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{FailurePolicy, ProviderKind, StateBackend};
    use crate::resource::{ResourceRef, Value};
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_document() {
        let yaml = r"
project:
  name: test-project
";
        let document = ConfigParser::new().parse_yaml(yaml, None).unwrap();

        assert_eq!(document.project.name, "test-project");
        assert_eq!(document.project.environment, "dev");
        assert!(document.resources.is_empty());
        assert_eq!(document.state.backend, StateBackend::Local);
        assert_eq!(document.provider.kind, ProviderKind::Echo);
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
project:
  name: shop
  environment: prod

engine:
  max_in_flight: 3
  failure_policy: abort_run
  retry:
    max_attempts: 2

state:
  backend: memory

provider:
  kind: http
  url: http://localhost:9000

resources:
  - kind: database
    name: main
    attributes:
      engine: postgres
      size: 2
      replicas: [a, b]
  - kind: app
    name: web
    depends_on: [database.main]
    attributes:
      db_url: "${database.main.url}"
      public: true
"#;
        let document = ConfigParser::new().parse_yaml(yaml, None).unwrap();

        assert_eq!(document.engine.max_in_flight, 3);
        assert_eq!(document.engine.failure_policy, FailurePolicy::AbortRun);
        assert_eq!(document.engine.retry.max_attempts, 2);
        assert_eq!(document.engine.retry.initial_backoff_ms, 200);
        assert_eq!(document.provider.url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(document.resources.len(), 2);

        let db = &document.resources[0];
        assert_eq!(db.attributes["size"], Value::Number(2.0));
        assert_eq!(
            db.attributes["replicas"],
            Value::List(vec![Value::from("a"), Value::from("b")])
        );

        let app = &document.resources[1];
        assert!(app.depends_on.contains(&ResourceRef::new("database", "main")));
        assert_eq!(app.attributes["public"], Value::Bool(true));
    }

    #[test]
    fn test_malformed_dependency_is_a_parse_error() {
        let yaml = r"
project:
  name: shop
resources:
  - kind: app
    name: web
    depends_on: [not-a-reference]
";
        let err = ConfigParser::new().parse_yaml(yaml, None).unwrap_err();
        assert!(matches!(err, ConvergeError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_null_attribute_is_rejected() {
        let yaml = r"
project:
  name: shop
resources:
  - kind: app
    name: web
    attributes:
      image: ~
";
        assert!(ConfigParser::new().parse_yaml(yaml, None).is_err());
    }

    #[test]
    fn test_overrides_apply_in_place() {
        let mut document = ConfigParser::new()
            .parse_yaml("project:\n  name: shop\n", None)
            .unwrap();
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_ENVIRONMENT, "staging"),
            (ENV_MAX_IN_FLIGHT, "9"),
            (ENV_PROVIDER_URL, "http://hooks.local"),
        ]);

        ConfigParser::apply_overrides(&mut document, |name| {
            vars.get(name).map(ToString::to_string)
        })
        .unwrap();

        assert_eq!(document.project.name, "shop");
        assert_eq!(document.project.environment, "staging");
        assert_eq!(document.engine.max_in_flight, 9);
        assert_eq!(document.provider.url.as_deref(), Some("http://hooks.local"));
    }

    #[test]
    fn test_malformed_numeric_override() {
        let mut document = ConfigParser::new()
            .parse_yaml("project:\n  name: shop\n", None)
            .unwrap();

        let err = ConfigParser::apply_overrides(&mut document, |name| {
            (name == ENV_INTERVAL_SECS).then(|| String::from("soon"))
        })
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("converge.yaml"), "project:\n  name: x\n").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("converge.yaml"));

        let document = ConfigParser::new().load_file(&found).unwrap();
        assert_eq!(document.project.name, "x");
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigParser::new()
            .load_file("/definitely/not/here/converge.yaml")
            .unwrap_err();
        assert!(matches!(err, ConvergeError::Config(ConfigError::FileNotFound { .. })));
    }
}
