//! Desired-state sources.
//!
//! The reconciler asks its source for the full set of desired resources at
//! the start of every run, so edits to the source are picked up by the next
//! cycle without restarting the loop.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::{ConfigParser, ConfigValidator};
use crate::error::Result;
use crate::resource::Resource;

/// Supplies the desired resources for a run.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    /// Returns the current desired resources.
    async fn desired(&self) -> Result<Vec<Resource>>;
}

/// In-memory source whose contents can be swapped at runtime.
#[derive(Debug, Default)]
pub struct StaticSource {
    resources: RwLock<Vec<Resource>>,
}

impl StaticSource {
    /// Creates a source holding `resources`.
    #[must_use]
    pub fn new(resources: Vec<Resource>) -> Self {
        Self {
            resources: RwLock::new(resources),
        }
    }

    /// Replaces the desired resources.
    pub async fn replace(&self, resources: Vec<Resource>) {
        *self.resources.write().await = resources;
    }
}

#[async_trait]
impl DesiredStateSource for StaticSource {
    async fn desired(&self) -> Result<Vec<Resource>> {
        Ok(self.resources.read().await.clone())
    }
}

/// Source reading a desired-state document from disk on every run.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    parser: ConfigParser,
}

impl FileSource {
    /// Creates a source for the document at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let parser = path
            .parent()
            .map_or_else(ConfigParser::new, |dir| ConfigParser::new().with_base_path(dir));
        Self { path, parser }
    }

    /// Returns the document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DesiredStateSource for FileSource {
    async fn desired(&self) -> Result<Vec<Resource>> {
        debug!("Reading desired state from {}", self.path.display());
        let document = self.parser.load_with_env(&self.path)?;
        let result = ConfigValidator::new().validate(&document)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }
        Ok(document.resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergeError;
    use crate::resource::ResourceRef;
    use std::io::Write;

    #[tokio::test]
    async fn test_static_source_replace() {
        let source = StaticSource::new(vec![Resource::new("database", "main")]);
        assert_eq!(source.desired().await.unwrap().len(), 1);

        source.replace(vec![]).await;
        assert!(source.desired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_source_rereads_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("converge.yaml");
        std::fs::write(
            &path,
            "project:\n  name: demo\nresources:\n  - kind: database\n    name: main\n",
        )
        .unwrap();

        let source = FileSource::new(&path);
        let first = source.desired().await.unwrap();
        assert_eq!(first[0].id(), ResourceRef::new("database", "main"));

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "  - kind: app\n    name: web").unwrap();

        assert_eq!(source.desired().await.unwrap().len(), 2);
        assert_eq!(source.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_file_source_rejects_invalid_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("converge.yaml");
        std::fs::write(
            &path,
            "project:\n  name: demo\nresources:\n  - kind: database\n    name: main\n  - kind: database\n    name: main\n",
        )
        .unwrap();

        let err = FileSource::new(&path).desired().await.unwrap_err();
        assert!(matches!(err, ConvergeError::Config(_)));
    }
}
