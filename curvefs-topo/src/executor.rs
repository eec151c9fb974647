//! Reconciliation executor.
//!
//! The change set is split into one lane per pool. Lanes share nothing, so a
//! fixed number of workers pull whole lanes from a queue and apply each lane
//! strictly in change-set order. Outcomes come back over a result channel and
//! are reassembled in the original order.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config::ExecutorConfig;
use crate::diff::{ChangeSet, Operation};
use crate::mds::MdsClient;
use crate::report::{OperationOutcome, OperationResult, SkipReason};
use crate::topology::EntityKey;

/// Operations of one pool, tagged with their change-set position.
struct Lane {
    pool: String,
    operations: Vec<(usize, Operation)>,
}

pub struct Executor {
    client: Arc<MdsClient>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(client: Arc<MdsClient>, config: ExecutorConfig) -> Self {
        Self { client, config }
    }

    /// Apply every operation and return one outcome per operation, in
    /// change-set order.
    pub async fn apply(&self, changes: &ChangeSet) -> Vec<OperationOutcome> {
        let lanes = split_lanes(changes);
        if lanes.is_empty() {
            return Vec::new();
        }
        let workers = self.config.workers.clamp(1, lanes.len());
        info!(
            "Applying {} operations across {} pools with {} workers",
            changes.len(),
            lanes.len(),
            workers
        );

        let (lane_tx, lane_rx) = mpsc::channel(lanes.len());
        for lane in lanes {
            // Capacity equals the lane count, so this never waits.
            let _ = lane_tx.send(lane).await;
        }
        drop(lane_tx);
        let lane_rx = Arc::new(Mutex::new(lane_rx));

        let (result_tx, mut result_rx) = mpsc::channel(changes.len().max(1));
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let client = Arc::clone(&self.client);
            let lane_rx = Arc::clone(&lane_rx);
            let result_tx = result_tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let lane = lane_rx.lock().await.recv().await;
                    match lane {
                        Some(lane) => run_lane(id, &client, lane, &result_tx).await,
                        None => break,
                    }
                }
            }));
        }
        drop(result_tx);

        let mut slots: Vec<Option<OperationOutcome>> = vec![None; changes.len()];
        while let Some((index, outcome)) = result_rx.recv().await {
            slots[index] = Some(outcome);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Executor worker terminated: {}", e);
            }
        }

        slots
            .into_iter()
            .zip(changes.iter())
            .map(|(slot, op)| {
                slot.unwrap_or_else(|| OperationOutcome {
                    operation: op.clone(),
                    result: OperationResult::Skipped(SkipReason::Interrupted),
                })
            })
            .collect()
    }
}

fn split_lanes(changes: &ChangeSet) -> Vec<Lane> {
    let mut by_pool: BTreeMap<String, Vec<(usize, Operation)>> = BTreeMap::new();
    for (index, op) in changes.iter().enumerate() {
        by_pool
            .entry(op.key().pool().to_string())
            .or_default()
            .push((index, op.clone()));
    }
    by_pool
        .into_iter()
        .map(|(pool, operations)| Lane { pool, operations })
        .collect()
}

async fn run_lane(
    worker: usize,
    client: &MdsClient,
    lane: Lane,
    results: &mpsc::Sender<(usize, OperationOutcome)>,
) {
    info!(worker, pool = %lane.pool, operations = lane.operations.len(), "Applying pool");
    // Keys that failed or were skipped in this lane.
    let mut blocked: Vec<EntityKey> = Vec::new();

    for (index, op) in lane.operations {
        let key = op.key();
        let result = match blocking_reason(&op, &blocked) {
            Some(reason) => {
                warn!("Skipping {}: {}", op, reason);
                OperationResult::Skipped(reason)
            }
            None => {
                let result = client.apply_operation(&op).await;
                match &result {
                    OperationResult::Failed(e) => error!("{} failed: {}", op, e),
                    _ => info!("{} succeeded", op),
                }
                result
            }
        };
        if !result.is_succeeded() {
            blocked.push(key);
        }

        if results
            .send((index, OperationOutcome { operation: op, result }))
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Creates and updates need their ancestors in place; deletes need their
/// descendants gone.
fn blocking_reason(op: &Operation, blocked: &[EntityKey]) -> Option<SkipReason> {
    let key = op.key();
    if op.kind().is_delete() {
        blocked
            .iter()
            .find(|b| key.is_ancestor_of(b))
            .map(|b| SkipReason::DescendantFailed(b.clone()))
    } else {
        blocked
            .iter()
            .find(|b| b.is_ancestor_of(&key))
            .map(|b| SkipReason::AncestorFailed(b.clone()))
    }
}
