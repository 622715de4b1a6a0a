//! Provider that acknowledges every operation locally.

use async_trait::async_trait;
use tracing::debug;

use crate::error::ProviderError;
use crate::planner::{Operation, OperationType};
use crate::state::ObservedAttributes;

use super::Provider;

/// Echoes desired attributes back as the live configuration.
///
/// Useful for dry local runs: the engine plans, executes and records state
/// exactly as it would against a real system, without side effects.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProvider;

impl EchoProvider {
    /// Creates a new echo provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for EchoProvider {
    async fn apply(&self, operation: &Operation) -> Result<ObservedAttributes, ProviderError> {
        debug!("echo: {}", operation.description());
        match operation.op_type {
            OperationType::Create | OperationType::Update => Ok(operation.resource.attributes.clone()),
            OperationType::Delete | OperationType::NoOp => Ok(ObservedAttributes::new()),
        }
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;

    fn operation(op_type: OperationType) -> Operation {
        Operation {
            op_type,
            resource: Resource::new("app", "web").with_attribute("image", "web:1"),
            reason: String::new(),
            details: vec![],
            dependencies: vec![],
            desired_hash: None,
        }
    }

    #[tokio::test]
    async fn test_create_echoes_attributes() {
        let attrs = EchoProvider::new().apply(&operation(OperationType::Create)).await.unwrap();
        assert_eq!(attrs, operation(OperationType::Create).resource.attributes);
    }

    #[tokio::test]
    async fn test_delete_reports_nothing() {
        let attrs = EchoProvider::new().apply(&operation(OperationType::Delete)).await.unwrap();
        assert!(attrs.is_empty());
        assert_eq!(EchoProvider::new().name(), "echo");
    }
}
