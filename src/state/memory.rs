//! In-memory state storage backend.
//!
//! Used for ephemeral engines and tests. State is lost when the store is
//! dropped.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

use super::lock::{check_revision, LockInfo};
use super::store::StateStore;
use super::types::ObservedState;

/// State store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<ObservedState>>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with an existing state.
    #[must_use]
    pub fn with_state(state: ObservedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            lock: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<ObservedState>> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &ObservedState) -> Result<()> {
        let mut stored = self.state.lock().await;
        check_revision(state.revision, stored.as_ref().map_or(0, |s| s.revision))?;
        debug!("Saving in-memory state at revision {}", state.revision);
        *stored = Some(state.clone());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.state.lock().await = None;
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state.lock().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().await;
        if let Some(existing) = guard.as_ref() {
            existing.ensure_lapsed()?;
        }

        let revision = self.state.lock().await.as_ref().map_or(0, |s| s.revision);
        let lease = LockInfo::grant(holder, revision);
        *guard = Some(lease.clone());
        Ok(lease)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut guard = self.lock.lock().await;
        if guard.as_ref().is_some_and(|lock| lock.lock_id == lock_id) {
            *guard = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .lock
            .lock()
            .await
            .as_ref()
            .is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_store_loads_nothing() {
        let store = MemoryStateStore::new();
        assert!(store.load().await.unwrap().is_none());
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryStateStore::new();
        let state = ObservedState::new("demo");
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("a").await.unwrap();
        assert!(store.acquire_lock("b").await.is_err());

        store.release_lock("someone-else").await.unwrap();
        assert!(store.is_locked().await.unwrap());

        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(!store.is_locked().await.unwrap());
        assert!(store.acquire_lock("b").await.is_ok());
    }

    #[tokio::test]
    async fn test_older_snapshot_does_not_replace_newer() {
        let mut newer = ObservedState::new("demo");
        newer.revision = 4;
        let store = MemoryStateStore::with_state(newer);

        let err = store.save(&ObservedState::new("demo")).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::ConvergeError::State(crate::error::StateError::StaleRevision { base: 0, stored: 4 })
        ));
        assert_eq!(store.acquire_lock("a").await.unwrap().base_revision, 4);
    }
}
