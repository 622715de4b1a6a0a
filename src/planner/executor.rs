//! Change-set executor.
//!
//! This module applies a change-set through a provider: dependency-ordered,
//! with bounded concurrency, per-operation timeouts and retries, and a
//! failure policy deciding what happens to the rest of the run. Observed
//! state is only ever written here, one resource at a time, after the
//! provider confirms an operation.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{EngineSettings, FailurePolicy};
use crate::error::{ErrorClass, ProviderError};
use crate::provider::Provider;
use crate::resource::ResourceRef;
use crate::state::{ObservedAttributes, ObservedState};

use super::plan::{ChangeSet, Operation, OperationType};
use super::retry::RetryPolicy;

/// Executor for change-sets.
pub struct ChangeSetExecutor {
    /// Provider applying operations.
    provider: Arc<dyn Provider>,
    /// Maximum operations in flight.
    max_in_flight: usize,
    /// Failure handling policy.
    failure_policy: FailurePolicy,
    /// Retry policy for retryable errors.
    retry: RetryPolicy,
    /// Deadline for a single provider call.
    operation_timeout: Duration,
}

/// Receiving half of a cancellation token.
///
/// A signal built with [`CancelSignal::never`] never fires. A signal whose
/// trigger was dropped counts as cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    receiver: Option<watch::Receiver<bool>>,
}

/// Sending half of a cancellation token.
#[derive(Debug)]
pub struct CancelTrigger {
    sender: watch::Sender<bool>,
}

/// Final status of a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The provider confirmed the operation.
    Succeeded,
    /// The provider failed the operation.
    Failed,
    /// Not attempted because a dependency failed or the run was aborted.
    Skipped,
    /// Not attempted because the run was cancelled.
    Cancelled,
}

/// What happened to one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    /// Index of the operation in the change-set.
    pub index: usize,
    /// Target resource.
    pub resource: ResourceRef,
    /// Operation type.
    pub op_type: OperationType,
    /// Final status.
    pub status: OutcomeStatus,
    /// Provider calls made.
    pub attempts: u32,
    /// Error message, for failed or skipped operations.
    pub error: Option<String>,
    /// Wall time spent on the operation, in milliseconds.
    pub duration_ms: u64,
}

/// Result of executing a change-set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    /// One outcome per actionable operation, in change-set order.
    pub outcomes: Vec<OperationOutcome>,
    /// True if the failure policy stopped the run early.
    pub aborted: bool,
    /// True if the run was cancelled before every operation started.
    pub cancelled: bool,
}

/// Result of a refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Resources whose live attributes were read.
    pub checked: usize,
    /// Resources whose live attributes changed.
    pub changed: Vec<ResourceRef>,
    /// Resources the provider no longer has; removed from state.
    pub vanished: Vec<ResourceRef>,
    /// Resources that could not be read; left untouched.
    pub failed: Vec<ResourceRef>,
}

/// Scheduling state of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Running,
    Settled(OutcomeStatus),
}

/// What a task reports back.
struct Attempted {
    result: Result<ObservedAttributes, ProviderError>,
    attempts: u32,
    elapsed: Duration,
}

/// Creates a connected cancellation trigger and signal.
#[must_use]
pub fn cancel_pair() -> (CancelTrigger, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        CancelTrigger { sender },
        CancelSignal {
            receiver: Some(receiver),
        },
    )
}

impl CancelSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.receiver
            .as_ref()
            .is_some_and(|rx| *rx.borrow() || rx.has_changed().is_err())
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&mut self) {
        match &mut self.receiver {
            None => std::future::pending::<()>().await,
            Some(rx) => {
                // An error means the trigger is gone, which also cancels.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }
        }
    }
}

impl CancelTrigger {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true if cancellation was already requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Creates another signal observing this trigger.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            receiver: Some(self.sender.subscribe()),
        }
    }
}

impl ChangeSetExecutor {
    /// Creates an executor from engine settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, settings: &EngineSettings) -> Self {
        Self {
            provider,
            max_in_flight: settings.max_in_flight.max(1),
            failure_policy: settings.failure_policy,
            retry: RetryPolicy::from(&settings.retry),
            operation_timeout: settings.operation_timeout(),
        }
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the per-operation deadline.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Executes a change-set, recording confirmed operations in `state`.
    ///
    /// Operations start once every operation they depend on succeeded, at
    /// most `max_in_flight` at a time, lowest index first. Cancellation is
    /// checked between operations: in-flight work settles, nothing new
    /// starts, and nothing is rolled back.
    pub async fn execute(
        &self,
        change_set: &ChangeSet,
        state: &mut ObservedState,
        cancel: &CancelSignal,
    ) -> ExecutionReport {
        let operations = &change_set.operations;
        info!(
            "Executing change-set with {} operations",
            change_set.actionable().count()
        );

        let mut slots: Vec<Slot> = operations
            .iter()
            .map(|op| {
                if op.is_actionable() {
                    Slot::Pending
                } else {
                    Slot::Settled(OutcomeStatus::Succeeded)
                }
            })
            .collect();
        let mut outcomes: Vec<Option<OperationOutcome>> = vec![None; operations.len()];
        let mut join_set: JoinSet<Attempted> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut aborted = false;

        loop {
            if self.failure_policy == FailurePolicy::SkipDependents {
                Self::skip_dependents_of_failures(operations, &mut slots, &mut outcomes);
            }

            let stop_starting = aborted || cancel.is_cancelled();
            if !stop_starting {
                for (index, op) in operations.iter().enumerate() {
                    if join_set.len() >= self.max_in_flight {
                        break;
                    }
                    let ready = slots[index] == Slot::Pending
                        && op
                            .dependencies
                            .iter()
                            .all(|dep| slots.get(*dep) == Some(&Slot::Settled(OutcomeStatus::Succeeded)));
                    if !ready {
                        continue;
                    }

                    info!("Starting {}", op.description());
                    slots[index] = Slot::Running;
                    let handle = join_set.spawn(run_operation(
                        Arc::clone(&self.provider),
                        op.clone(),
                        self.retry.clone(),
                        self.operation_timeout,
                    ));
                    running.insert(handle.id(), index);
                }
            }

            let Some(joined) = join_set.join_next_with_id().await else {
                break;
            };

            let (index, attempted) = match joined {
                Ok((id, attempted)) => (running.remove(&id), attempted),
                Err(join_error) => {
                    let index = running.remove(&join_error.id());
                    let message = format!("operation task failed: {join_error}");
                    error!("{message}");
                    let resource = index
                        .and_then(|i| operations.get(i))
                        .map(Operation::id)
                        .unwrap_or_else(|| ResourceRef::new("unknown", "unknown"));
                    (
                        index,
                        Attempted {
                            result: Err(ProviderError::rejected(resource, message)),
                            attempts: 1,
                            elapsed: Duration::ZERO,
                        },
                    )
                }
            };
            let Some(index) = index else {
                continue;
            };
            let op = &operations[index];

            let Attempted {
                result,
                attempts,
                elapsed,
            } = attempted;
            let outcome = match result {
                Ok(reported) => {
                    Self::record(state, op, reported);
                    info!("{} succeeded after {attempts} attempt(s)", op.description());
                    settled(index, op, OutcomeStatus::Succeeded, attempts, elapsed, None)
                }
                Err(e) => {
                    error!("{} failed after {attempts} attempt(s): {e}", op.description());
                    if self.failure_policy == FailurePolicy::AbortRun {
                        aborted = true;
                    }
                    settled(index, op, OutcomeStatus::Failed, attempts, elapsed, Some(e.to_string()))
                }
            };
            slots[index] = Slot::Settled(outcome.status);
            outcomes[index] = Some(outcome);
        }

        let cancelled = cancel.is_cancelled();
        for (index, op) in operations.iter().enumerate() {
            if slots[index] != Slot::Pending {
                continue;
            }
            let (status, reason) = if aborted {
                (OutcomeStatus::Skipped, "run aborted after a failure")
            } else if cancelled {
                (OutcomeStatus::Cancelled, "run cancelled")
            } else {
                (OutcomeStatus::Skipped, "dependencies did not succeed")
            };
            debug!("{} {status}: {reason}", op.description());
            slots[index] = Slot::Settled(status);
            outcomes[index] = Some(not_attempted(index, op, status, reason));
        }

        let report = ExecutionReport {
            outcomes: outcomes.into_iter().flatten().collect(),
            aborted,
            cancelled: cancelled && !aborted && slots.iter().any(|s| *s == Slot::Settled(OutcomeStatus::Cancelled)),
        };
        info!("{report}");
        report
    }

    /// Refreshes live attributes of every recorded resource.
    ///
    /// Resources the provider no longer has are removed from state, so the
    /// next plan recreates them. Read failures leave the record untouched.
    pub async fn refresh(&self, state: &mut ObservedState) -> RefreshReport {
        let mut report = RefreshReport::default();
        let recorded: Vec<_> = state.resources.values().cloned().collect();

        for resource in recorded {
            let id = resource.id();
            report.checked += 1;

            let observed = match tokio::time::timeout(self.operation_timeout, self.provider.observe(&resource)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    resource: id.clone(),
                    timeout_ms: duration_ms(self.operation_timeout),
                }),
            };

            match observed {
                Ok(Some(attributes)) => {
                    if state.refresh_attributes(&id, attributes) {
                        info!("Live attributes of {id} changed");
                        report.changed.push(id);
                    }
                }
                Ok(None) => {
                    warn!("{id} no longer exists on the target system");
                    state.remove(&id);
                    report.vanished.push(id);
                }
                Err(e) => {
                    warn!("Failed to refresh {id}: {e}");
                    report.failed.push(id);
                }
            }
        }

        debug!(
            "Refreshed {} resources: {} changed, {} vanished, {} failed",
            report.checked,
            report.changed.len(),
            report.vanished.len(),
            report.failed.len()
        );
        report
    }

    /// Marks every pending operation that depends on a failed or skipped
    /// one as skipped. Dependencies always have lower indices, so one pass
    /// in index order reaches the transitive closure.
    fn skip_dependents_of_failures(
        operations: &[Operation],
        slots: &mut [Slot],
        outcomes: &mut [Option<OperationOutcome>],
    ) {
        for (index, op) in operations.iter().enumerate() {
            if slots[index] != Slot::Pending {
                continue;
            }
            let blocked = op.dependencies.iter().find(|dep| {
                matches!(
                    slots.get(**dep),
                    Some(Slot::Settled(OutcomeStatus::Failed | OutcomeStatus::Skipped))
                )
            });
            if let Some(dep) = blocked {
                let reason = format!("dependency {} did not succeed", operations[*dep].id());
                warn!("Skipping {}: {reason}", op.description());
                slots[index] = Slot::Settled(OutcomeStatus::Skipped);
                outcomes[index] = Some(not_attempted(index, op, OutcomeStatus::Skipped, &reason));
            }
        }
    }

    fn record(state: &mut ObservedState, op: &Operation, reported: ObservedAttributes) {
        match op.op_type {
            OperationType::Create | OperationType::Update => {
                state.record_applied(&op.resource, reported, op.desired_hash.as_deref().unwrap_or_default());
            }
            OperationType::Delete => {
                state.remove(&op.id());
            }
            OperationType::NoOp => {}
        }
    }
}

impl std::fmt::Debug for ChangeSetExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSetExecutor")
            .field("provider", &self.provider.name())
            .field("max_in_flight", &self.max_in_flight)
            .field("failure_policy", &self.failure_policy)
            .field("retry", &self.retry)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

/// Drives one operation to a final result: timeout per attempt, retries
/// with backoff for retryable errors.
async fn run_operation(
    provider: Arc<dyn Provider>,
    op: Operation,
    retry: RetryPolicy,
    timeout: Duration,
) -> Attempted {
    let started = Instant::now();
    let mut attempt = 1;

    loop {
        let result = match tokio::time::timeout(timeout, provider.apply(&op)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                resource: op.id(),
                timeout_ms: duration_ms(timeout),
            }),
        };

        let error = match result {
            Ok(reported) => {
                let non_finite = reported
                    .iter()
                    .find_map(|(key, value)| value.non_finite_path().map(|path| format!("{key}{path}")));
                let result = match non_finite {
                    None => Ok(reported),
                    Some(attribute) => Err(ProviderError::rejected(
                        op.id(),
                        format!("reported a non-finite number for '{attribute}'"),
                    )),
                };
                return Attempted {
                    result,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }
            Err(ProviderError::NotFound { .. }) if op.op_type == OperationType::Delete => {
                info!("{} was already gone", op.id());
                return Attempted {
                    result: Ok(ObservedAttributes::new()),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }
            Err(e) => e,
        };

        let class = provider.classify(&error);
        if class == ErrorClass::Fatal || !retry.should_retry(attempt) {
            return Attempted {
                result: Err(error),
                attempts: attempt,
                elapsed: started.elapsed(),
            };
        }

        let delay = retry.backoff(attempt);
        warn!(
            "{} attempt {attempt}/{} failed ({class}): {error}; retrying in {}ms",
            op.description(),
            retry.max_attempts(),
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn settled(
    index: usize,
    op: &Operation,
    status: OutcomeStatus,
    attempts: u32,
    elapsed: Duration,
    error: Option<String>,
) -> OperationOutcome {
    OperationOutcome {
        index,
        resource: op.id(),
        op_type: op.op_type,
        status,
        attempts,
        error,
        duration_ms: duration_ms(elapsed),
    }
}

fn not_attempted(index: usize, op: &Operation, status: OutcomeStatus, reason: &str) -> OperationOutcome {
    OperationOutcome {
        index,
        resource: op.id(),
        op_type: op.op_type,
        status,
        attempts: 0,
        error: Some(reason.to_string()),
        duration_ms: 0,
    }
}

impl ExecutionReport {
    fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Returns the number of succeeded operations.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(OutcomeStatus::Succeeded)
    }

    /// Returns the number of failed operations.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(OutcomeStatus::Failed)
    }

    /// Returns the number of skipped operations.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(OutcomeStatus::Skipped)
    }

    /// Returns the number of cancelled operations.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.count(OutcomeStatus::Cancelled)
    }

    /// Returns true if every operation succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.status == OutcomeStatus::Succeeded)
    }

    /// Returns the outcome for a resource, if it had an operation.
    #[must_use]
    pub fn outcome_for(&self, resource: &ResourceRef) -> Option<&OperationOutcome> {
        self.outcomes.iter().find(|o| &o.resource == resource)
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} operations: {} succeeded, {} failed, {} skipped, {} cancelled",
            self.outcomes.len(),
            self.succeeded(),
            self.failed(),
            self.skipped(),
            self.cancelled_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;
    use crate::graph::GraphBuilder;
    use crate::planner::Planner;
    use crate::provider::MockProvider;
    use crate::resource::{Resource, Value};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    fn db() -> Resource {
        Resource::new("database", "main").with_attribute("engine", "postgres")
    }

    fn app() -> Resource {
        Resource::new("app", "web").with_attribute("db_url", "${database.main.url}")
    }

    fn change_set(desired: Vec<Resource>, state: &ObservedState) -> ChangeSet {
        let graph = GraphBuilder::new().build(desired).unwrap();
        Planner::new().plan(&graph, state).unwrap()
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            retry: RetrySettings {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                multiplier: 2.0,
            },
            ..EngineSettings::default()
        }
    }

    fn statuses(report: &ExecutionReport) -> Vec<(String, OutcomeStatus)> {
        report
            .outcomes
            .iter()
            .map(|o| (o.resource.to_string(), o.status))
            .collect()
    }

    #[tokio::test]
    async fn test_dependencies_apply_first_and_state_is_recorded() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);

        let mut provider = MockProvider::new();
        provider.expect_apply().times(2).returning(move |op| {
            seen.lock().unwrap().push(op.id().to_string());
            let mut reported = ObservedAttributes::new();
            reported.insert(String::from("id"), Value::from(op.id().to_string()));
            Ok(reported)
        });

        let mut state = ObservedState::new("test");
        let plan = change_set(vec![app(), db()], &state);
        let executor = ChangeSetExecutor::new(Arc::new(provider), &settings());
        let report = executor.execute(&plan, &mut state, &CancelSignal::never()).await;

        assert!(report.all_succeeded());
        assert_eq!(*order.lock().unwrap(), vec!["database.main", "app.web"]);
        assert_eq!(state.len(), 2);
        let live = state.get(&ResourceRef::new("database", "main")).unwrap();
        assert_eq!(live.attributes["engine"], Value::from("postgres"));
        assert_eq!(live.attributes["id"], Value::from("database.main"));
        assert_eq!(live.applied_hash, plan.operations[0].desired_hash.clone().unwrap());
    }

    #[tokio::test]
    async fn test_fatal_failure_skips_dependents() {
        let mut provider = MockProvider::new();
        provider
            .expect_apply()
            .times(1)
            .returning(|op| Err(ProviderError::rejected(op.id(), "quota exceeded")));
        provider.expect_classify().returning(ProviderError::default_class);

        let mut state = ObservedState::new("test");
        let plan = change_set(vec![db(), app()], &state);
        let executor = ChangeSetExecutor::new(Arc::new(provider), &settings());
        let report = executor.execute(&plan, &mut state, &CancelSignal::never()).await;

        assert_eq!(
            statuses(&report),
            vec![
                (String::from("database.main"), OutcomeStatus::Failed),
                (String::from("app.web"), OutcomeStatus::Skipped),
            ]
        );
        assert_eq!(report.outcomes[0].attempts, 1);
        assert!(!report.aborted);
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut provider = MockProvider::new();
        provider.expect_apply().returning(move |op| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::transient(op.id(), "503"))
            } else {
                Ok(ObservedAttributes::new())
            }
        });
        provider.expect_classify().returning(ProviderError::default_class);

        let mut state = ObservedState::new("test");
        let plan = change_set(vec![db()], &state);
        let executor = ChangeSetExecutor::new(Arc::new(provider), &settings());
        let report = executor.execute(&plan, &mut state, &CancelSignal::never()).await;

        assert!(report.all_succeeded());
        assert_eq!(report.outcomes[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut provider = MockProvider::new();
        provider
            .expect_apply()
            .times(3)
            .returning(|op| Err(ProviderError::transient(op.id(), "503")));
        provider.expect_classify().times(3).returning(ProviderError::default_class);

        let mut state = ObservedState::new("test");
        let plan = change_set(vec![db()], &state);
        let executor = ChangeSetExecutor::new(Arc::new(provider), &settings());
        let report = executor.execute(&plan, &mut state, &CancelSignal::never()).await;

        assert_eq!(report.failed(), 1);
        assert_eq!(report.outcomes[0].attempts, 3);
        assert!(report.outcomes[0].error.as_deref().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_succeeds() {
        let mut state = ObservedState::new("test");
        state.record_applied(&db(), ObservedAttributes::new(), "h");

        let mut provider = MockProvider::new();
        provider
            .expect_apply()
            .times(1)
            .returning(|op| Err(ProviderError::NotFound { resource: op.id() }));

        let plan = change_set(vec![], &state);
        let executor = ChangeSetExecutor::new(Arc::new(provider), &settings());
        let report = executor.execute(&plan, &mut state, &CancelSignal::never()).await;

        assert!(report.all_succeeded());
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_abort_run_stops_independent_branches() {
        let mut provider = MockProvider::new();
        provider
            .expect_apply()
            .times(1)
            .returning(|op| Err(ProviderError::rejected(op.id(), "denied")));
        provider.expect_classify().returning(ProviderError::default_class);

        let mut state = ObservedState::new("test");
        let plan = change_set(
            vec![Resource::new("queue", "a"), Resource::new("queue", "b"), Resource::new("queue", "c")],
            &state,
        );
        let settings = EngineSettings {
            max_in_flight: 1,
            failure_policy: FailurePolicy::AbortRun,
            ..settings()
        };
        let executor = ChangeSetExecutor::new(Arc::new(provider), &settings);
        let report = executor.execute(&plan, &mut state, &CancelSignal::never()).await;

        assert!(report.aborted);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_attempts_nothing() {
        let mut provider = MockProvider::new();
        provider.expect_apply().never();

        let (trigger, signal) = cancel_pair();
        trigger.cancel();

        let mut state = ObservedState::new("test");
        let plan = change_set(vec![db(), app()], &state);
        let executor = ChangeSetExecutor::new(Arc::new(provider), &settings());
        let report = executor.execute(&plan, &mut state, &signal).await;

        assert!(report.cancelled);
        assert_eq!(report.cancelled_count(), 2);
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_non_finite_reported_attributes_fail_the_operation() {
        let mut provider = MockProvider::new();
        provider.expect_apply().times(1).returning(|_| {
            let mut reported = ObservedAttributes::new();
            reported.insert(String::from("load"), Value::Number(f64::NAN));
            Ok(reported)
        });

        let mut state = ObservedState::new("test");
        let plan = change_set(vec![db()], &state);
        let executor = ChangeSetExecutor::new(Arc::new(provider), &settings());
        let report = executor.execute(&plan, &mut state, &CancelSignal::never()).await;

        assert_eq!(report.failed(), 1);
        assert!(report.outcomes[0].error.as_deref().unwrap().contains("'load'"));
        assert!(state.is_empty());
    }

    #[test]
    fn test_cancel_signal_semantics() {
        assert!(!CancelSignal::never().is_cancelled());

        let (trigger, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        let second = trigger.signal();
        trigger.cancel();
        assert!(signal.is_cancelled());
        assert!(second.is_cancelled());
        assert!(trigger.is_cancelled());

        let (trigger, signal) = cancel_pair();
        drop(trigger);
        assert!(signal.is_cancelled());
    }

    /// Provider that sleeps on every call and tracks concurrency.
    struct SlowProvider {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Provider for SlowProvider {
        async fn apply(&self, _operation: &Operation) -> Result<ObservedAttributes, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ObservedAttributes::new())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_operations_run_concurrently_within_the_limit() {
        let provider = Arc::new(SlowProvider {
            delay: Duration::from_millis(50),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let mut state = ObservedState::new("test");
        let plan = change_set(
            vec![Resource::new("bucket", "x"), Resource::new("bucket", "y"), Resource::new("bucket", "z")],
            &state,
        );
        let settings = EngineSettings {
            max_in_flight: 2,
            ..settings()
        };
        let executor = ChangeSetExecutor::new(Arc::clone(&provider) as Arc<dyn Provider>, &settings);
        let report = executor.execute(&plan, &mut state, &CancelSignal::never()).await;

        assert!(report.all_succeeded());
        assert_eq!(provider.peak.load(Ordering::SeqCst), 2);
        assert_eq!(state.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_lets_in_flight_work_settle_and_cancels_the_rest() {
        let provider = Arc::new(SlowProvider {
            delay: Duration::from_millis(50),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let mut state = ObservedState::new("test");
        let plan = change_set(vec![db(), app()], &state);
        let executor = ChangeSetExecutor::new(Arc::clone(&provider) as Arc<dyn Provider>, &settings());
        let (trigger, signal) = cancel_pair();

        let cancel_mid_flight = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(provider.in_flight.load(Ordering::SeqCst), 1);
            trigger.cancel();
        };
        let (report, ()) = tokio::join!(executor.execute(&plan, &mut state, &signal), cancel_mid_flight);

        assert!(report.cancelled);
        assert_eq!(
            statuses(&report),
            vec![
                (String::from("database.main"), OutcomeStatus::Succeeded),
                (String::from("app.web"), OutcomeStatus::Cancelled),
            ]
        );
        assert_eq!(report.outcomes[1].attempts, 0);
        assert!(state.contains(&ResourceRef::new("database", "main")));
        assert!(!state.contains(&ResourceRef::new("app", "web")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let provider = Arc::new(SlowProvider {
            delay: Duration::from_secs(60),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let mut state = ObservedState::new("test");
        let plan = change_set(vec![db()], &state);
        let executor = ChangeSetExecutor::new(provider, &settings())
            .with_retry_policy(RetryPolicy::no_retry())
            .with_operation_timeout(Duration::from_secs(1));
        let report = executor.execute(&plan, &mut state, &CancelSignal::never()).await;

        assert_eq!(report.failed(), 1);
        assert!(report.outcomes[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_refresh_updates_and_drops_records() {
        let mut state = ObservedState::new("test");
        state.record_applied(&db(), ObservedAttributes::new(), "h1");
        state.record_applied(&app(), ObservedAttributes::new(), "h2");

        let mut provider = MockProvider::new();
        provider.expect_observe().returning(|resource| {
            if resource.kind == "app" {
                return Ok(None);
            }
            let mut live = resource.attributes.clone();
            live.insert(String::from("engine"), Value::from("mysql"));
            Ok(Some(live))
        });

        let executor = ChangeSetExecutor::new(Arc::new(provider), &settings());
        let report = executor.refresh(&mut state).await;

        assert_eq!(report.checked, 2);
        assert_eq!(report.changed, vec![ResourceRef::new("database", "main")]);
        assert_eq!(report.vanished, vec![ResourceRef::new("app", "web")]);
        assert_eq!(state.len(), 1);

        let replan = change_set(vec![db(), app()], &state);
        assert_ok!(serde_json::to_string(&replan));
        assert_eq!(replan.update_count(), 1);
        assert_eq!(replan.create_count(), 1);
    }
}
