//! Snapshot pipeline: policy assignment, inventory sync, auto snapshots, inventory sync.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::engine::{StepFailure, StepHandler, StepHandlers};
use super::types::{ConcurrencyPolicy, Job, JobKind, JobStatus, NewJob, StepDef};
use crate::platform::SnapshotOps;

pub const POLICY_ASSIGN: &str = "policy_assign";
pub const RVTOOLS_PRE: &str = "rvtools_pre";
pub const AUTO_SNAPSHOTS: &str = "auto_snapshots";
pub const RVTOOLS_POST: &str = "rvtools_post";

pub const STEPS: [StepDef; 4] = [
    StepDef::new(POLICY_ASSIGN, "Assign snapshot policies"),
    StepDef::new(RVTOOLS_PRE, "Sync inventory (before snapshots)"),
    StepDef::new(AUTO_SNAPSHOTS, "Run auto snapshots"),
    StepDef::new(RVTOOLS_POST, "Sync inventory (after snapshots)"),
];

/// Only one snapshot pipeline may be pending or running at a time.
pub const POLICY: ConcurrencyPolicy = ConcurrencyPolicy::Singleton;

pub fn new_job(triggered_by: &str) -> NewJob {
    NewJob {
        kind: JobKind::SnapshotPipeline,
        initial_status: JobStatus::Pending,
        subject: None,
        exclusivity_key: POLICY.exclusivity_key(JobKind::SnapshotPipeline, None),
        payload: serde_json::json!({}),
        triggered_by: triggered_by.to_string(),
        steps: STEPS.to_vec(),
    }
}

#[derive(Clone, Copy)]
enum Operation {
    AssignPolicies,
    SyncInventory,
    AutoSnapshots,
}

struct SnapshotStep {
    ops: Arc<dyn SnapshotOps>,
    operation: Operation,
}

#[async_trait]
impl StepHandler for SnapshotStep {
    async fn run(&self, _job: &Job) -> Result<Option<serde_json::Value>, StepFailure> {
        let report = match self.operation {
            Operation::AssignPolicies => self.ops.assign_policies().await,
            Operation::SyncInventory => self.ops.sync_inventory().await,
            Operation::AutoSnapshots => self.ops.run_auto_snapshots().await,
        }?;
        Ok(Some(report))
    }
}

pub fn handlers(ops: Arc<dyn SnapshotOps>) -> StepHandlers {
    let step = |operation| -> Arc<dyn StepHandler> {
        Arc::new(SnapshotStep {
            ops: ops.clone(),
            operation,
        })
    };
    HashMap::from([
        (POLICY_ASSIGN, step(Operation::AssignPolicies)),
        (RVTOOLS_PRE, step(Operation::SyncInventory)),
        (AUTO_SNAPSHOTS, step(Operation::AutoSnapshots)),
        (RVTOOLS_POST, step(Operation::SyncInventory)),
    ])
}
