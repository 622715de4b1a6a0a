//! Observed state management.
//!
//! This module persists the last-known live configuration of every managed
//! resource, along with a bounded history of reconciliation runs and an
//! advisory lock that keeps concurrent engines from planning against the
//! same snapshot.

mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{ObservedAttributes, ObservedResource, ObservedState, RunHistoryEntry, STATE_VERSION};
