//! Reconciliation report.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::diff::{ChangeSet, Operation, PoolDrift};
use crate::mds::MdsError;
use crate::topology::EntityKey;

/// Why an operation was not attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A create or update whose parent could not be applied.
    AncestorFailed(EntityKey),
    /// A delete whose children could not be removed.
    DescendantFailed(EntityKey),
    /// The worker applying the pool stopped before reporting this operation.
    Interrupted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AncestorFailed(key) => write!(f, "ancestor failed: {}", key),
            SkipReason::DescendantFailed(key) => write!(f, "descendant failed: {}", key),
            SkipReason::Interrupted => write!(f, "executor worker stopped"),
        }
    }
}

/// Outcome of one applied operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum OperationResult {
    Succeeded,
    Failed(MdsError),
    Skipped(SkipReason),
}

impl OperationResult {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, OperationResult::Succeeded)
    }

    fn label(&self) -> &'static str {
        match self {
            OperationResult::Succeeded => "succeeded",
            OperationResult::Failed(_) => "failed",
            OperationResult::Skipped(_) => "skipped",
        }
    }

    fn reason(&self) -> String {
        match self {
            OperationResult::Succeeded => "-".to_string(),
            OperationResult::Failed(e) => e.to_string(),
            OperationResult::Skipped(r) => r.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub operation: Operation,
    pub result: OperationResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    FullySucceeded,
    PartiallySucceeded,
    Failed,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportStatus::FullySucceeded => "FullySucceeded",
            ReportStatus::PartiallySucceeded => "PartiallySucceeded",
            ReportStatus::Failed => "Failed",
        })
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Completed,
    /// The live topology could not be fetched; nothing was applied.
    Aborted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub run_id: String,
    pub status: ReportStatus,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub outcomes: Vec<OperationOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub drift: Vec<PoolDrift>,
    /// A conflict was observed; the caller should re-run from a fresh fetch.
    pub rerun_recommended: bool,
}

impl ReconciliationReport {
    pub fn completed(
        run_id: String,
        started_at: DateTime<Utc>,
        outcomes: Vec<OperationOutcome>,
        drift: Vec<PoolDrift>,
    ) -> Self {
        let mut report = Self {
            run_id,
            status: ReportStatus::FullySucceeded,
            state: RunState::Completed,
            started_at,
            finished_at: Utc::now(),
            abort_reason: None,
            rerun_recommended: outcomes
                .iter()
                .any(|o| matches!(&o.result, OperationResult::Failed(e) if e.is_conflict())),
            outcomes,
            drift,
        };
        report.status = report.compute_status();
        report
    }

    pub fn aborted(run_id: String, started_at: DateTime<Utc>, reason: &MdsError) -> Self {
        Self {
            run_id,
            status: ReportStatus::Failed,
            state: RunState::Aborted,
            started_at,
            finished_at: Utc::now(),
            abort_reason: Some(reason.to_string()),
            outcomes: Vec::new(),
            drift: Vec::new(),
            rerun_recommended: false,
        }
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for outcome in &self.outcomes {
            match outcome.result {
                OperationResult::Succeeded => counts.succeeded += 1,
                OperationResult::Failed(_) => counts.failed += 1,
                OperationResult::Skipped(_) => counts.skipped += 1,
            }
        }
        counts
    }

    fn compute_status(&self) -> ReportStatus {
        if self.state == RunState::Aborted {
            return ReportStatus::Failed;
        }
        let counts = self.counts();
        if counts.failed == 0 && counts.skipped == 0 {
            ReportStatus::FullySucceeded
        } else if counts.succeeded == 0 {
            ReportStatus::Failed
        } else {
            ReportStatus::PartiallySucceeded
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human readable rendering: one row per operation plus a summary.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        if !self.outcomes.is_empty() {
            let rows: Vec<OutcomeRow> = self.outcomes.iter().map(OutcomeRow::from).collect();
            out.push_str(&Table::new(rows).to_string());
            out.push('\n');
        }
        for drift in &self.drift {
            out.push_str(&format!("drift: {} (not applied)\n", drift));
        }
        if let Some(reason) = &self.abort_reason {
            out.push_str(&format!("aborted: {}\n", reason));
        }
        let counts = self.counts();
        out.push_str(&format!(
            "{}: {} succeeded, {} failed, {} skipped\n",
            self.status, counts.succeeded, counts.failed, counts.skipped
        ));
        if self.rerun_recommended {
            out.push_str("topology changed concurrently, re-run to reconcile from a fresh fetch\n");
        }
        out
    }
}

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "OPERATION")]
    operation: String,
    #[tabled(rename = "KEY")]
    key: String,
    #[tabled(rename = "RESULT")]
    result: String,
    #[tabled(rename = "REASON")]
    reason: String,
}

impl From<&OperationOutcome> for OutcomeRow {
    fn from(outcome: &OperationOutcome) -> Self {
        Self {
            operation: outcome.operation.kind().to_string(),
            key: outcome.operation.key().to_string(),
            result: outcome.result.label().to_string(),
            reason: outcome.result.reason(),
        }
    }
}

#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "PLANNED")]
    operation: String,
}

/// Render a change set that was computed but not applied.
pub fn render_plan(changes: &ChangeSet) -> String {
    let mut out = String::new();
    if changes.is_empty() {
        out.push_str("topology is up to date\n");
    } else {
        let rows: Vec<PlanRow> = changes
            .iter()
            .enumerate()
            .map(|(i, op)| PlanRow {
                index: i + 1,
                operation: op.to_string(),
            })
            .collect();
        out.push_str(&Table::new(rows).to_string());
        out.push('\n');
    }
    for drift in &changes.drift {
        out.push_str(&format!("drift: {} (not applied)\n", drift));
    }
    out
}
