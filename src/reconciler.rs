//! Reconciliation loop.
//!
//! This module drives the pipeline end to end: read desired state, refresh
//! observed state, build the graph, plan, execute and persist. A run can be
//! invoked directly or from a background loop woken by a timer tick or an
//! external signal. Runs never overlap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::error::{ConvergeError, ReconcileError, Result};
use crate::graph::GraphBuilder;
use crate::planner::{
    cancel_pair, CancelSignal, CancelTrigger, ChangeSet, ChangeSetExecutor, DiffEngine, DiffType,
    ExecutionReport, OperationOutcome, OperationType, OutcomeStatus, Planner,
};
use crate::provider::Provider;
use crate::resource::ResourceRef;
use crate::source::DesiredStateSource;
use crate::state::{generate_holder_id, ObservedState, RunHistoryEntry, StateStore};

/// Reconciler for maintaining desired state.
pub struct Reconciler {
    /// Desired-state source.
    source: Arc<dyn DesiredStateSource>,
    /// Provider applying operations.
    provider: Arc<dyn Provider>,
    /// Observed-state store.
    store: Arc<dyn StateStore>,
    /// Engine settings.
    settings: EngineSettings,
    /// Project name used for fresh state.
    project: String,
    /// Lock holder identity.
    holder: String,
    /// Graph builder.
    builder: GraphBuilder,
    /// Planner.
    planner: Planner,
    /// Latest published status.
    status: RwLock<StatusSnapshot>,
    /// Serializes runs.
    run_guard: Mutex<()>,
}

/// Phase of the reconciliation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No cycle has completed, or the loop stopped.
    Idle,
    /// Reading desired state and planning.
    Planning,
    /// Executing a change-set.
    Applying,
    /// The last cycle left live state matching desired state.
    Converged,
    /// The last cycle failed or left work undone.
    Degraded,
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Periodic interval tick.
    Timer,
    /// External signal through [`ReconcileHandle::trigger`].
    Signal,
    /// Direct invocation of [`Reconciler::run_once`].
    Manual,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every operation succeeded, or there was nothing to do.
    Converged,
    /// Some operations failed or were skipped.
    PartialFailure,
    /// Planning failed or the run was aborted.
    Failed,
    /// The run was cancelled before every operation started.
    Cancelled,
}

/// Record of one full reconciliation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationRun {
    /// Run identifier.
    pub id: String,
    /// What started the run.
    pub trigger: Trigger,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Overall status.
    pub status: RunStatus,
    /// Hash of the desired state planned against.
    pub desired_hash: String,
    /// Outcome of every non-no-op operation.
    pub outcomes: Vec<OperationOutcome>,
    /// Planned creates.
    pub created: usize,
    /// Planned updates.
    pub updated: usize,
    /// Planned deletes.
    pub deleted: usize,
    /// Resources already converged.
    pub unchanged: usize,
    /// Error that ended the run, if any.
    pub error: Option<String>,
}

/// Read-only view of the reconciler.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Current phase.
    pub phase: Phase,
    /// Observed state after the latest run.
    pub observed: ObservedState,
    /// Latest run, if any.
    pub last_run: Option<ReconciliationRun>,
}

/// Handle to a background reconciliation loop.
#[derive(Debug)]
pub struct ReconcileHandle {
    cancel: CancelTrigger,
    signals: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// A resource whose live state differs from desired state.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Resource identity.
    pub resource: ResourceRef,
    /// Kind of difference.
    pub change: String,
    /// Attributes involved.
    pub fields: Vec<String>,
}

/// Report of drift detection.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Whether any difference was detected.
    pub has_drift: bool,
    /// Differences found.
    pub entries: Vec<DriftEntry>,
    /// Number of desired resources.
    pub total_resources: usize,
    /// Number of recorded resources.
    pub observed_count: usize,
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        source: Arc<dyn DesiredStateSource>,
        provider: Arc<dyn Provider>,
        store: Arc<dyn StateStore>,
        settings: EngineSettings,
    ) -> Self {
        let project = String::from("default");
        Self {
            source,
            provider,
            store,
            settings,
            status: RwLock::new(StatusSnapshot {
                phase: Phase::Idle,
                observed: ObservedState::new(&project),
                last_run: None,
            }),
            project,
            holder: generate_holder_id(),
            builder: GraphBuilder::new(),
            planner: Planner::new(),
            run_guard: Mutex::new(()),
        }
    }

    /// Sets the project name recorded in fresh state.
    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self.status.get_mut().observed = ObservedState::new(&self.project);
        self
    }

    /// Returns the engine settings.
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Runs one cycle immediately.
    ///
    /// # Errors
    ///
    /// Returns a configuration error (cycle, dangling dependency, invalid
    /// document) before any operation is attempted, and state errors when
    /// the store cannot be locked, read or written. Failed operations are
    /// not errors; they are reported in the returned run.
    pub async fn run_once(&self) -> Result<ReconciliationRun> {
        self.run_with(Trigger::Manual, &CancelSignal::never()).await
    }

    /// Runs one cycle, stopping between operations once `cancel` fires.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::run_once`].
    pub async fn run_with(&self, trigger: Trigger, cancel: &CancelSignal) -> Result<ReconciliationRun> {
        self.run_cycle(trigger, cancel, None).await
    }

    /// Runs one cycle that applies `confirmed` and nothing else.
    ///
    /// The cycle re-plans under the state lock and stops before any
    /// operation when the result differs from `confirmed`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::PlanChanged`] when desired or observed
    /// state moved since `confirmed` was planned, and otherwise the errors
    /// of [`Reconciler::run_once`].
    pub async fn apply_confirmed(&self, confirmed: &ChangeSet) -> Result<ReconciliationRun> {
        self.run_cycle(Trigger::Manual, &CancelSignal::never(), Some(confirmed))
            .await
    }

    async fn run_cycle(
        &self,
        trigger: Trigger,
        cancel: &CancelSignal,
        confirmed: Option<&ChangeSet>,
    ) -> Result<ReconciliationRun> {
        let _guard = self.run_guard.lock().await;
        let id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!("Starting reconciliation run {id} ({trigger})");
        self.set_phase(Phase::Planning).await;

        let lock = match self.store.acquire_lock(&self.holder).await {
            Ok(lock) => lock,
            Err(e) => return Err(self.fail(id, trigger, started_at, e).await),
        };

        let result = self.run_locked(&id, trigger, started_at, cancel, confirmed).await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock: {e}");
        }

        match result {
            Ok(run) => {
                let phase = if run.status == RunStatus::Converged {
                    Phase::Converged
                } else {
                    Phase::Degraded
                };
                info!(
                    "Run {} finished: {} ({} operations)",
                    run.id,
                    run.status,
                    run.outcomes.len()
                );
                let mut status = self.status.write().await;
                status.phase = phase;
                status.last_run = Some(run.clone());
                Ok(run)
            }
            Err(e) => Err(self.fail(id, trigger, started_at, e).await),
        }
    }

    async fn run_locked(
        &self,
        id: &str,
        trigger: Trigger,
        started_at: DateTime<Utc>,
        cancel: &CancelSignal,
        confirmed: Option<&ChangeSet>,
    ) -> Result<ReconciliationRun> {
        let mut state = self
            .store
            .load()
            .await?
            .unwrap_or_else(|| ObservedState::new(&self.project));
        let executor = ChangeSetExecutor::new(Arc::clone(&self.provider), &self.settings);

        if self.settings.refresh && !state.is_empty() {
            let refreshed = executor.refresh(&mut state).await;
            if !refreshed.changed.is_empty() || !refreshed.vanished.is_empty() {
                info!(
                    "Refresh found {} changed and {} vanished resources",
                    refreshed.changed.len(),
                    refreshed.vanished.len()
                );
            }
        }

        let change_set = self.plan_against(&state).await?;
        if let Some(reason) = confirmed.and_then(|confirmed| plan_mismatch(confirmed, &change_set)) {
            return Err(ReconcileError::PlanChanged { reason }.into());
        }
        self.status.write().await.observed = state.clone();

        let report = if change_set.is_empty() {
            info!("No changes required - state is converged");
            ExecutionReport::default()
        } else {
            info!(
                "Plan: {} creates, {} updates, {} deletes, {} unchanged",
                change_set.create_count(),
                change_set.update_count(),
                change_set.delete_count(),
                change_set.unchanged_count()
            );
            self.set_phase(Phase::Applying).await;
            executor.execute(&change_set, &mut state, cancel).await
        };

        let run = ReconciliationRun {
            id: id.to_string(),
            trigger,
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::from_report(&report),
            desired_hash: change_set.desired_hash.clone(),
            created: change_set.create_count(),
            updated: change_set.update_count(),
            deleted: change_set.delete_count(),
            unchanged: change_set.unchanged_count(),
            error: summarize_failures(&report),
            outcomes: report.outcomes,
        };

        state.add_history(run.history_entry());
        self.store.save(&state).await?;
        self.status.write().await.observed = state;
        Ok(run)
    }

    /// Plans against the persisted state without applying anything.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from graph building or planning, and
    /// state errors when the store cannot be read.
    pub async fn plan(&self) -> Result<ChangeSet> {
        let state = self.load_refreshed().await?;
        self.plan_against(&state).await
    }

    /// Compares desired state with refreshed observed state without
    /// applying or persisting anything.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from graph building, and state errors
    /// when the store cannot be read.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let state = self.load_refreshed().await?;
        let graph = self.builder.build(self.source.desired().await?)?;
        let diff = DiffEngine::new().compute_diff(&graph, &state);

        let entries: Vec<DriftEntry> = diff
            .actionable_diffs()
            .into_iter()
            .map(|d| DriftEntry {
                resource: d.resource.clone(),
                change: d.diff_type.to_string(),
                fields: d.details.iter().map(|detail| detail.field.clone()).collect(),
            })
            .collect();

        debug!("Drift check found {} differences", entries.len());
        Ok(DriftReport {
            has_drift: diff.has_changes(),
            entries,
            total_resources: graph.len(),
            observed_count: state.len(),
        })
    }

    /// Returns a snapshot of the current phase, observed state and last run.
    pub async fn status(&self) -> StatusSnapshot {
        self.status.read().await.clone()
    }

    /// Starts a background loop running a cycle on every interval tick and
    /// on every external signal. The first tick fires immediately; a zero
    /// interval is raised to one second.
    #[must_use]
    pub fn start(self: &Arc<Self>, interval: Duration) -> ReconcileHandle {
        let interval = if interval.is_zero() { Duration::from_secs(1) } else { interval };
        let (cancel, signal) = cancel_pair();
        let (signals, receiver) = mpsc::channel(1);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run_loop(interval, receiver, signal).await });

        ReconcileHandle {
            cancel,
            signals,
            task,
        }
    }

    async fn run_loop(&self, interval: Duration, mut signals: mpsc::Receiver<()>, mut cancel: CancelSignal) {
        info!("Reconciliation loop started (interval {}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut signals_open = true;

        loop {
            let trigger = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = signals.recv(), if signals_open => {
                    if received.is_none() {
                        signals_open = false;
                        continue;
                    }
                    Trigger::Signal
                }
                _ = ticker.tick() => Trigger::Timer,
            };

            // Failures are recorded in status; the next cycle still runs.
            if let Err(e) = self.run_with(trigger, &cancel).await {
                error!("Reconciliation cycle failed: {e}");
            }
        }

        self.set_phase(Phase::Idle).await;
        info!("Reconciliation loop stopped");
    }

    async fn load_refreshed(&self) -> Result<ObservedState> {
        let mut state = self
            .store
            .load()
            .await?
            .unwrap_or_else(|| ObservedState::new(&self.project));
        if self.settings.refresh && !state.is_empty() {
            ChangeSetExecutor::new(Arc::clone(&self.provider), &self.settings)
                .refresh(&mut state)
                .await;
        }
        Ok(state)
    }

    async fn plan_against(&self, state: &ObservedState) -> Result<ChangeSet> {
        let desired = self.source.desired().await?;
        let graph = self.builder.build(desired)?;
        debug!("Built dependency graph with {} resources", graph.len());
        Ok(self.planner.plan(&graph, state)?)
    }

    async fn set_phase(&self, phase: Phase) {
        let mut status = self.status.write().await;
        if status.phase != phase {
            debug!("Phase {} -> {phase}", status.phase);
            status.phase = phase;
        }
    }

    /// Publishes a failed run and hands the error back.
    async fn fail(&self, id: String, trigger: Trigger, started_at: DateTime<Utc>, e: ConvergeError) -> ConvergeError {
        error!("Run {id} failed: {e}");
        let run = ReconciliationRun {
            id,
            trigger,
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::Failed,
            desired_hash: String::new(),
            outcomes: Vec::new(),
            created: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            error: Some(e.to_string()),
        };
        let mut status = self.status.write().await;
        status.phase = Phase::Degraded;
        status.last_run = Some(run);
        e
    }
}

/// Describes how `planned` differs from `confirmed`, if it does.
fn plan_mismatch(confirmed: &ChangeSet, planned: &ChangeSet) -> Option<String> {
    if confirmed.desired_hash != planned.desired_hash {
        return Some(String::from("desired state changed"));
    }
    if confirmed.operations != planned.operations {
        return Some(String::from("observed state changed"));
    }
    None
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.project)
            .field("holder", &self.holder)
            .field("settings", &self.settings)
            .field("store", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

fn summarize_failures(report: &ExecutionReport) -> Option<String> {
    let failed: Vec<String> = report
        .outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::Failed)
        .map(|o| match &o.error {
            Some(message) => format!("{}: {message}", o.resource),
            None => o.resource.to_string(),
        })
        .collect();

    if failed.is_empty() {
        None
    } else {
        Some(failed.join("; "))
    }
}

impl RunStatus {
    fn from_report(report: &ExecutionReport) -> Self {
        if report.aborted {
            Self::Failed
        } else if report.cancelled {
            Self::Cancelled
        } else if report.all_succeeded() {
            Self::Converged
        } else {
            Self::PartialFailure
        }
    }
}

impl ReconciliationRun {
    /// Returns true if the run converged.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.status == RunStatus::Converged
    }

    /// Returns the status of the operation on `resource`, if it had one.
    #[must_use]
    pub fn outcome_for(&self, resource: &ResourceRef) -> Option<OutcomeStatus> {
        self.outcomes
            .iter()
            .find(|o| &o.resource == resource)
            .map(|o| o.status)
    }

    fn history_entry(&self) -> RunHistoryEntry {
        RunHistoryEntry {
            run_id: self.id.clone(),
            timestamp: self.finished_at,
            trigger: self.trigger,
            status: self.status,
            desired_hash: self.desired_hash.clone(),
            resources: self
                .outcomes
                .iter()
                .filter(|o| o.op_type != OperationType::NoOp)
                .map(|o| o.resource.to_string())
                .collect(),
            error: self.error.clone(),
        }
    }
}

impl ReconcileHandle {
    /// Requests a cycle as soon as the current one settles.
    ///
    /// Signals arriving while one is already queued are coalesced.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::LoopStopped`] if the loop has exited.
    pub fn trigger(&self) -> Result<()> {
        match self.signals.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(ReconcileError::LoopStopped.into()),
        }
    }

    /// Stops the loop. A run in progress finishes its in-flight operations
    /// and starts no new ones.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the loop task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to exit.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::TaskFailed`] if the loop task panicked.
    pub async fn join(self) -> Result<()> {
        let Self { cancel, signals, task } = self;
        drop(signals);
        let result = task.await;
        drop(cancel);
        result.map_err(|e| ReconcileError::TaskFailed { message: e.to_string() }.into())
    }

    /// Cancels the loop and waits for it to exit.
    ///
    /// # Errors
    ///
    /// See [`ReconcileHandle::join`].
    pub async fn stop(self) -> Result<()> {
        self.cancel();
        self.join().await
    }
}

impl DriftReport {
    /// Returns true if live state matches desired state.
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        !self.has_drift
    }

    /// Returns only the entries whose live attributes diverged.
    #[must_use]
    pub fn drifted(&self) -> Vec<&DriftEntry> {
        let drift = DiffType::Drift.to_string();
        self.entries.iter().filter(|e| e.change == drift).collect()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Applying => "applying",
            Self::Converged => "converged",
            Self::Degraded => "degraded",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timer => "timer",
            Self::Signal => "signal",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Converged => "converged",
            Self::PartialFailure => "partial failure",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_drift {
            writeln!(f, "Drift detected:")?;
            for entry in &self.entries {
                write!(f, "  - {} ({})", entry.resource, entry.change)?;
                if !entry.fields.is_empty() {
                    write!(f, ": {}", entry.fields.join(", "))?;
                }
                writeln!(f)?;
            }
        } else {
            write!(f, "No drift detected - state is converged")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ReconciliationRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Reconciliation {} ({}):", self.status, self.trigger)?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Deleted: {}", self.deleted)?;
        writeln!(f, "  Unchanged: {}", self.unchanged)?;

        let unsuccessful: Vec<&OperationOutcome> = self
            .outcomes
            .iter()
            .filter(|o| o.status != OutcomeStatus::Succeeded)
            .collect();
        if !unsuccessful.is_empty() {
            writeln!(f, "  Problems:")?;
            for outcome in unsuccessful {
                write!(f, "    - {} {}: {}", outcome.op_type, outcome.resource, outcome.status)?;
                if let Some(error) = &outcome.error {
                    write!(f, " ({error})")?;
                }
                writeln!(f)?;
            }
        }

        if let Some(error) = &self.error
            && self.outcomes.is_empty()
        {
            writeln!(f, "  Error: {error}")?;
        }

        Ok(())
    }
}
