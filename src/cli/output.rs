//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::graph::DependencyGraph;
use crate::planner::{ChangeSet, OperationType, OutcomeStatus};
use crate::reconciler::{DriftReport, ReconciliationRun, RunStatus};
use crate::state::{LockInfo, ObservedState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Change-set operation row for table display.
#[derive(Tabled)]
struct OperationRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Revision")]
    revision: u64,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Operation outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Error")]
    error: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        if self.format == OutputFormat::Json {
            return to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }));
        }

        let mut output = String::new();
        if result.is_valid() {
            let _ = writeln!(output, "{} Desired state is valid.", "✓".green());
        } else {
            let _ = writeln!(output, "{} {} error(s):", "✗".red(), result.error_count());
            for error in &result.errors {
                let _ = writeln!(output, "   - {error}");
            }
        }

        if show_warnings && !result.warnings.is_empty() {
            let _ = writeln!(output, "\n{} {} warning(s):", "⚠".yellow(), result.warning_count());
            for warning in &result.warnings {
                let _ = writeln!(output, "   - {warning}");
            }
        }
        output
    }

    /// Formats a dependency graph as depth layers.
    #[must_use]
    pub fn format_graph(&self, graph: &DependencyGraph) -> String {
        if self.format == OutputFormat::Json {
            let layers: Vec<Vec<String>> = graph
                .layers()
                .iter()
                .map(|layer| layer.iter().map(ToString::to_string).collect())
                .collect();
            return to_json(&serde_json::json!({
                "order": graph.order().iter().map(ToString::to_string).collect::<Vec<_>>(),
                "layers": layers,
            }));
        }

        if graph.is_empty() {
            return String::from("No resources declared.\n");
        }

        let mut output = String::new();
        for (depth, layer) in graph.layers().iter().enumerate() {
            let _ = writeln!(output, "{}", format!("depth {depth}").bold());
            for id in layer {
                let deps: Vec<String> = graph.dependencies(id).iter().map(ToString::to_string).collect();
                if deps.is_empty() {
                    let _ = writeln!(output, "   {id}");
                } else {
                    let _ = writeln!(output, "   {id} {} {}", "<-".dimmed(), deps.join(", "));
                }
            }
        }
        output
    }

    /// Formats a change-set for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ChangeSet, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &ChangeSet, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - live state matches desired state.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nChange-set\n   Desired hash: {}\n\n", short(&plan.desired_hash));

        let rows: Vec<OperationRow> = plan
            .actionable()
            .map(|(i, op)| OperationRow {
                index: i + 1,
                action: Self::format_operation_type(op.op_type),
                resource: op.id().to_string(),
                after: op
                    .dependencies
                    .iter()
                    .map(|d| (d + 1).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                reason: truncate(&op.reason, 40),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for (_, op) in plan.actionable().filter(|(_, op)| !op.details.is_empty()) {
                let _ = writeln!(output, "\n   {}", op.id().to_string().bold());
                for detail in &op.details {
                    let _ = writeln!(output, "     {detail}");
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.delete_count().to_string().red(),
            plan.unchanged_count()
        );
        output
    }

    /// Formats a reconciliation run.
    #[must_use]
    pub fn format_run(&self, run: &ReconciliationRun) -> String {
        if self.format == OutputFormat::Json {
            return to_json(run);
        }

        let headline = match run.status {
            RunStatus::Converged => format!("{} Reconciliation converged", "✓".green()),
            RunStatus::PartialFailure => format!("{} Reconciliation partially failed", "⚠".yellow()),
            RunStatus::Failed => format!("{} Reconciliation failed", "✗".red()),
            RunStatus::Cancelled => format!("{} Reconciliation cancelled", "⚠".yellow()),
        };

        let mut output = format!("{headline} (run {})\n\n", short(&run.id));
        let _ = writeln!(output, "   Created: {}", run.created);
        let _ = writeln!(output, "   Updated: {}", run.updated);
        let _ = writeln!(output, "   Deleted: {}", run.deleted);
        let _ = writeln!(output, "   Unchanged: {}", run.unchanged);

        if !run.outcomes.is_empty() {
            let rows: Vec<OutcomeRow> = run
                .outcomes
                .iter()
                .map(|o| OutcomeRow {
                    action: Self::format_operation_type(o.op_type),
                    resource: o.resource.to_string(),
                    result: Self::format_outcome(o.status),
                    attempts: o.attempts,
                    error: o.error.as_deref().map(|e| truncate(e, 50)).unwrap_or_default(),
                })
                .collect();
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        } else if let Some(error) = &run.error {
            let _ = write!(output, "\n{} {error}\n", "✗".red());
        }
        output
    }

    /// Formats recorded resources and lock status.
    #[must_use]
    pub fn format_status(&self, state: &ObservedState, lock: Option<&LockInfo>) -> String {
        if self.format == OutputFormat::Json {
            return to_json(&serde_json::json!({
                "project": state.project,
                "revision": state.revision,
                "resources": state.resources.values().collect::<Vec<_>>(),
                "lock": lock,
                "last_run": state.history.last(),
            }));
        }

        let mut output = String::new();
        let _ = write!(output, "\nProject: {} (revision {})\n\n", state.project, state.revision);

        if state.is_empty() {
            output.push_str("   No resources recorded.\n");
        } else {
            let rows: Vec<ResourceRow> = state
                .resources
                .values()
                .map(|r| ResourceRow {
                    resource: r.id().to_string(),
                    revision: r.revision,
                    hash: short(&r.applied_hash),
                    depends_on: r
                        .depends_on
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                    updated: r.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
                .collect();
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if let Some(last) = state.history.last() {
            let _ = write!(
                output,
                "\nLast run: {} at {} ({})\n",
                Self::format_run_status(last.status),
                last.timestamp.format("%Y-%m-%d %H:%M:%S"),
                last.trigger
            );
        }

        if let Some(lock) = lock {
            let _ = writeln!(
                output,
                "{} Locked by {} ({}s remaining)",
                "⚠".yellow(),
                lock.holder,
                lock.remaining_secs()
            );
        }
        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!("{} No drift detected - state is converged.\n", "✓".green())
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for entry in &report.entries {
                        let _ = write!(output, "   - {} ({})", entry.resource, entry.change);
                        if !entry.fields.is_empty() {
                            let _ = write!(output, ": {}", entry.fields.join(", "));
                        }
                        output.push('\n');
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} declared resources differ ({} recorded).\n",
                        report.entries.len(),
                        report.total_resources,
                        report.observed_count
                    );
                    output
                }
            }
        }
    }

    /// Formats the full observed state.
    #[must_use]
    pub fn format_state(&self, state: &ObservedState) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}\n\n", state.project);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Revision: {}", state.revision);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.len());

                for resource in state.resources.values() {
                    let _ = writeln!(output, "\n   {}", resource.id().to_string().bold());
                    for (key, value) in &resource.attributes {
                        let _ = writeln!(output, "     {key} = {value}");
                    }
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let _ = writeln!(
                            output,
                            "     {} {} - {} ({})",
                            Self::format_run_status(entry.status),
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.trigger,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => to_json(lock),
            OutputFormat::Text => format!(
                "{} State locked by {} at revision {}\n   Lock ID: {}\n   Expires: {}\n",
                "✓".green(),
                lock.holder,
                lock.base_revision,
                lock.lock_id,
                lock.expires_at
            ),
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow().to_string(), message)
    }

    fn message(&self, status: &str, marker: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => format!("{marker} {message}"),
        }
    }

    fn format_operation_type(op_type: OperationType) -> String {
        match op_type {
            OperationType::Create => "+create".green().to_string(),
            OperationType::Update => "~update".yellow().to_string(),
            OperationType::Delete => "-delete".red().to_string(),
            OperationType::NoOp => "noop".dimmed().to_string(),
        }
    }

    fn format_outcome(status: OutcomeStatus) -> String {
        match status {
            OutcomeStatus::Succeeded => "succeeded".green().to_string(),
            OutcomeStatus::Failed => "failed".red().to_string(),
            OutcomeStatus::Skipped => "skipped".yellow().to_string(),
            OutcomeStatus::Cancelled => "cancelled".dimmed().to_string(),
        }
    }

    fn format_run_status(status: RunStatus) -> String {
        match status {
            RunStatus::Converged => "✓".green().to_string(),
            RunStatus::PartialFailure | RunStatus::Cancelled => "⚠".yellow().to_string(),
            RunStatus::Failed => "✗".red().to_string(),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn short(hash: &str) -> String {
    hash.chars().take(8).collect()
}

/// Truncates a string to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
