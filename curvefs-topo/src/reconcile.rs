//! One reconciliation run: fetch, diff, apply, report.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::diff::{diff, ChangeSet};
use crate::executor::Executor;
use crate::mds::{MdsClient, MdsError};
use crate::report::{ReconciliationReport, ReportStatus};
use crate::topology::DesiredState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetching,
    Diffing,
    Applying,
    Reporting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct Reconciler {
    client: Arc<MdsClient>,
    executor: Executor,
}

impl Reconciler {
    pub fn new(client: Arc<MdsClient>, config: ExecutorConfig) -> Self {
        Self {
            executor: Executor::new(Arc::clone(&client), config),
            client,
        }
    }

    /// Fetch the live topology and compute the change set without applying it.
    pub async fn plan(&self, desired: &DesiredState) -> Result<ChangeSet, MdsError> {
        let live = self.client.fetch_topology().await?;
        Ok(diff(desired, &live))
    }

    /// Converge the MDS topology onto `desired`.
    ///
    /// Never fails: a fetch failure yields an aborted report, apply failures
    /// are recorded per operation.
    pub async fn run(&self, desired: &DesiredState) -> ReconciliationReport {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        info!(run_id = %run_id, phase = %Phase::Fetching, "Fetching live topology");
        let live = match self.client.fetch_topology().await {
            Ok(live) => live,
            Err(e) => {
                error!(run_id = %run_id, "Failed to fetch live topology, aborting: {}", e);
                return ReconciliationReport::aborted(run_id, started_at, &e);
            }
        };

        info!(run_id = %run_id, phase = %Phase::Diffing, "Computing change set");
        let changes = diff(desired, &live);
        drop(live);
        for drift in &changes.drift {
            warn!("Pool attributes cannot be changed in place, {}", drift);
        }
        info!(
            run_id = %run_id,
            operations = changes.len(),
            "{} operations to apply",
            changes.len()
        );

        info!(run_id = %run_id, phase = %Phase::Applying, "Applying change set");
        let outcomes = self.executor.apply(&changes).await;

        info!(run_id = %run_id, phase = %Phase::Reporting, "Building report");
        let report =
            ReconciliationReport::completed(run_id, started_at, outcomes, changes.drift);
        let counts = report.counts();
        match report.status {
            ReportStatus::FullySucceeded => info!(
                "Reconciliation finished: {} operations succeeded",
                counts.succeeded
            ),
            status => warn!(
                "Reconciliation finished {}: {} succeeded, {} failed, {} skipped",
                status, counts.succeeded, counts.failed, counts.skipped
            ),
        }
        if report.rerun_recommended {
            warn!("Topology changed concurrently, re-run to reconcile from a fresh fetch");
        }
        report
    }
}
