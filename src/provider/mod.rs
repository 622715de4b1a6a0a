//! Provider capability.
//!
//! A provider is the only component that talks to the target system. The
//! executor hands it one operation at a time and interprets its errors
//! through [`Provider::classify`].

mod echo;
mod http;

use async_trait::async_trait;

use crate::error::{ErrorClass, ProviderError};
use crate::planner::Operation;
use crate::state::{ObservedAttributes, ObservedResource};

pub use echo::EchoProvider;
pub use http::{HttpProvider, PROVIDER_TOKEN_ENV};

/// Applies operations to a target system.
///
/// Implementations must be safe to call concurrently for independent
/// resources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Applies a create, update or delete.
    ///
    /// On success returns the attributes the target system reports for the
    /// resource, such as computed addresses. Deletes return an empty map.
    async fn apply(&self, operation: &Operation) -> Result<ObservedAttributes, ProviderError>;

    /// Reads the live attributes of a previously applied resource.
    ///
    /// Returns `None` when the resource no longer exists. The default
    /// implementation reports the recorded attributes unchanged.
    async fn observe(
        &self,
        resource: &ObservedResource,
    ) -> Result<Option<ObservedAttributes>, ProviderError> {
        Ok(Some(resource.attributes.clone()))
    }

    /// Decides whether an error is worth retrying.
    fn classify(&self, error: &ProviderError) -> ErrorClass {
        error.default_class()
    }

    /// Short provider name for logs and status output.
    fn name(&self) -> &'static str;
}
