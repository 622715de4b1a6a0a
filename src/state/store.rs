//! State store trait definition.
//!
//! This module defines the common interface for observed-state backends.

use async_trait::async_trait;

use crate::error::Result;
use super::lock::LockInfo;
use super::types::ObservedState;

/// Trait for observed-state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the observed state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<ObservedState>>;

    /// Saves the observed state.
    async fn save(&self, state: &ObservedState) -> Result<()>;

    /// Deletes the observed state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires a lock on the state.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases a lock on the state.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
