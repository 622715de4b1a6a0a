//! Planning and execution.
//!
//! This module compares the desired graph with observed state, produces an
//! ordered change-set, and applies it through a provider.

mod diff;
mod executor;
mod plan;
mod retry;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{
    cancel_pair, CancelSignal, CancelTrigger, ChangeSetExecutor, ExecutionReport, OperationOutcome,
    OutcomeStatus, RefreshReport,
};
pub use plan::{ChangeSet, Operation, OperationType, Planner};
pub use retry::RetryPolicy;
