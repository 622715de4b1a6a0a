//! Single-writer lease over the observed-state snapshot.
//!
//! A run takes the lease before loading state and returns it after saving.
//! The lease remembers the snapshot revision it was granted at, so a store
//! can refuse a save planned against a snapshot that someone else has since
//! replaced.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StateError;

/// Seconds a lease stays valid before another writer may take it over.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// A granted lease on the state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Lease identifier, needed to release it.
    pub lock_id: String,
    /// Engine or operator holding the lease.
    pub holder: String,
    /// Snapshot revision when the lease was granted.
    #[serde(default)]
    pub base_revision: u64,
    /// Grant time.
    pub acquired_at: DateTime<Utc>,
    /// Time after which the lease may be taken over.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Grants a lease to `holder` over a snapshot at `base_revision`.
    ///
    /// An empty holder is replaced by [`generate_holder_id`].
    #[must_use]
    pub fn grant(holder: &str, base_revision: u64) -> Self {
        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let acquired_at = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder,
            base_revision,
            acquired_at,
            expires_at: acquired_at + Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Returns true once the lease may be taken over.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Returns true if the lease has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Seconds left before the lease lapses, never negative.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    /// Refuses a new lease while this one is still live.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockedByOther`] if the lease has not lapsed.
    pub fn ensure_lapsed(&self) -> std::result::Result<(), StateError> {
        if self.is_expired() {
            return Ok(());
        }
        Err(StateError::LockedByOther {
            holder: self.holder.clone(),
            since: self.acquired_at.to_rfc3339(),
        })
    }

    /// Checks that a snapshot stored at `stored_revision` is still the one
    /// this lease was granted over.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StaleRevision`] if the stored snapshot moved on.
    pub fn ensure_current(&self, stored_revision: u64) -> std::result::Result<(), StateError> {
        check_revision(self.base_revision, stored_revision)
    }
}

/// Refuses to replace a snapshot at `stored` with one based on `base`.
///
/// # Errors
///
/// Returns [`StateError::StaleRevision`] when `stored` is newer than `base`.
pub fn check_revision(base: u64, stored: u64) -> std::result::Result<(), StateError> {
    if stored > base {
        return Err(StateError::StaleRevision { base, stored });
    }
    Ok(())
}

/// Builds a holder identity of the form `host-pid-xxxxxxxx`.
#[must_use]
pub fn generate_holder_id() -> String {
    let host = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().into_owned());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_is_live() {
        let lease = LockInfo::grant("engine-a", 7);
        assert_eq!(lease.holder, "engine-a");
        assert_eq!(lease.base_revision, 7);
        assert!(!lease.is_expired());
        assert!(lease.remaining_secs() > 0);
        assert!(matches!(lease.ensure_lapsed(), Err(StateError::LockedByOther { .. })));
    }

    #[test]
    fn test_lease_lapses_at_expiry() {
        let lease = LockInfo::grant("engine-a", 0);
        assert!(!lease.is_expired_at(lease.expires_at - Duration::seconds(1)));
        assert!(lease.is_expired_at(lease.expires_at));

        let mut lapsed = lease;
        lapsed.expires_at = Utc::now() - Duration::seconds(1);
        assert_eq!(lapsed.remaining_secs(), 0);
        assert!(lapsed.ensure_lapsed().is_ok());
    }

    #[test]
    fn test_empty_holder_gets_process_identity() {
        let lease = LockInfo::grant("", 0);
        assert!(lease.holder.contains(&std::process::id().to_string()));
        assert_ne!(generate_holder_id(), generate_holder_id());
    }

    #[test]
    fn test_stale_snapshot_is_refused() {
        let lease = LockInfo::grant("engine-a", 3);
        assert!(lease.ensure_current(3).is_ok());
        assert!(lease.ensure_current(2).is_ok());
        assert!(matches!(
            lease.ensure_current(4),
            Err(StateError::StaleRevision { base: 3, stored: 4 })
        ));
    }
}
