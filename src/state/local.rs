//! Observed state persisted as JSON on the local filesystem.
//!
//! The snapshot and its lease live side by side in one directory. The
//! snapshot is replaced through a temporary file and a rename, so readers
//! never see a half-written document. The lease file is created exclusively,
//! so two writers racing for it cannot both win. A store remembers the lease
//! it holds and refuses to save over a snapshot that moved on since the
//! lease was granted.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{check_revision, LockInfo};
use super::store::StateStore;
use super::types::ObservedState;

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";

/// Only the revision of a stored snapshot, read without the resources.
#[derive(Deserialize)]
struct StoredRevision {
    #[serde(default)]
    revision: u64,
}

/// State store backed by a directory on the local filesystem.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Directory holding the snapshot and the lease.
    dir: PathBuf,
    /// Lease this store instance holds, if any.
    held: Mutex<Option<LockInfo>>,
}

impl LocalStateStore {
    /// Creates a store over `dir`. The directory is created on first write.
    #[must_use]
    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Mutex::new(None),
        }
    }

    /// Returns the path of the snapshot file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Returns the path of the lease file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Reads and parses a JSON file, or `None` if it does not exist.
    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(format!("Failed to read {}: {e}", path.display())).into());
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StateError::corrupted(format!("Failed to parse {}: {e}", path.display())).into())
    }

    /// Revision of the stored snapshot, 0 when there is none.
    async fn stored_revision(&self) -> Result<u64> {
        let stored: Option<StoredRevision> = Self::read_json(&self.state_path()).await?;
        Ok(stored.map_or(0, |s| s.revision))
    }

    async fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            StateError::write_failed(format!("Failed to create {}: {e}", self.dir.display())).into()
        })
    }

    /// Replaces the snapshot file atomically.
    async fn write_snapshot(&self, state: &ObservedState) -> Result<()> {
        self.create_dir().await?;
        let content = to_json(state)?;
        let target = self.state_path();
        let temp = self.dir.join(format!("{STATE_FILE}.tmp"));
        let failed = |e: std::io::Error| -> ConvergeError {
            StateError::write_failed(format!("Failed to write {}: {e}", target.display())).into()
        };

        let mut file = fs::File::create(&temp).await.map_err(failed)?;
        file.write_all(&content).await.map_err(failed)?;
        file.sync_all().await.map_err(failed)?;
        fs::rename(&temp, &target).await.map_err(failed)
    }

    /// Creates the lease file; fails if another writer created it first.
    async fn create_lease_file(&self, lease: &LockInfo) -> Result<()> {
        self.create_dir().await?;
        let content = to_json(lease)?;
        let failed = |e: std::io::Error| -> ConvergeError {
            StateError::LockFailed {
                message: format!("Failed to write lease: {e}"),
            }
            .into()
        };

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path())
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StateError::LockFailed {
                    message: String::from("another writer took the lease first"),
                }
                .into());
            }
            Err(e) => return Err(failed(e)),
        };
        file.write_all(&content).await.map_err(failed)?;
        file.sync_all().await.map_err(failed)
    }

    /// Removes a file, treating a missing file as already removed.
    async fn remove(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::write_failed(format!("Failed to remove {}: {e}", path.display())).into()),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| {
        StateError::Serialization {
            message: e.to_string(),
        }
        .into()
    })
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<ObservedState>> {
        let state: Option<ObservedState> = Self::read_json(&self.state_path()).await?;
        match &state {
            Some(state) => debug!("Loaded state revision {} from {}", state.revision, self.dir.display()),
            None => debug!("No state in {}", self.dir.display()),
        }
        Ok(state)
    }

    async fn save(&self, state: &ObservedState) -> Result<()> {
        let stored = self.stored_revision().await?;
        let mut held = self.held.lock().await;

        if let Some(lease) = held.as_mut() {
            let current: Option<LockInfo> = Self::read_json(&self.lock_path()).await?;
            if let Some(current) = current.filter(|current| current.lock_id != lease.lock_id) {
                return Err(StateError::LockedByOther {
                    holder: current.holder,
                    since: current.acquired_at.to_rfc3339(),
                }
                .into());
            }
            lease.ensure_current(stored)?;
            self.write_snapshot(state).await?;
            lease.base_revision = state.revision;
        } else {
            check_revision(state.revision, stored)?;
            self.write_snapshot(state).await?;
        }

        debug!("Saved state revision {} to {}", state.revision, self.dir.display());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        info!("Deleting state in {}", self.dir.display());
        let mut held = self.held.lock().await;
        Self::remove(&self.state_path()).await?;
        Self::remove(&self.lock_path()).await?;
        *held = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        fs::try_exists(self.state_path())
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to stat state: {e}")).into())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut held = self.held.lock().await;

        let existing: Option<LockInfo> = Self::read_json(&self.lock_path()).await?;
        if let Some(existing) = existing {
            existing.ensure_lapsed()?;
            warn!("Taking over lapsed lease held by {}", existing.holder);
            Self::remove(&self.lock_path()).await?;
        }

        let lease = LockInfo::grant(holder, self.stored_revision().await?);
        self.create_lease_file(&lease).await?;
        debug!(
            "Granted lease {} to {} at revision {}",
            lease.lock_id, lease.holder, lease.base_revision
        );

        *held = Some(lease.clone());
        Ok(lease)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut held = self.held.lock().await;

        let current: Option<LockInfo> = Self::read_json(&self.lock_path()).await?;
        match current {
            Some(current) if current.lock_id == lock_id => {
                Self::remove(&self.lock_path()).await?;
                debug!("Released lease {lock_id}");
            }
            Some(current) => debug!("Lease {lock_id} already replaced by {}", current.lock_id),
            None => {}
        }

        if held.as_ref().is_some_and(|lease| lease.lock_id == lock_id) {
            *held = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Self::read_json(&self.lock_path()).await
    }

    async fn is_locked(&self) -> Result<bool> {
        let lease: Option<LockInfo> = self.get_lock_info().await?;
        Ok(lease.is_some_and(|lease| !lease.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
