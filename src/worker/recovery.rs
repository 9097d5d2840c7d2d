use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::jobs::{Job, JobId, JobStatus, JobStore, StepStatus, StepUpdate, StoreError};

pub const INTERRUPTED_STEP_ERROR: &str = "interrupted: worker restarted while step was running";
pub const INTERRUPTED_JOB_ERROR: &str = "interrupted";
/// Recorded when a run was abandoned because the store failed mid-run.
pub const STORE_FAILURE_ERROR: &str = "interrupted: store error";

/// Fail jobs left `running` by a worker that is no longer driving them.
///
/// A job counts as stale when it was claimed more than `grace` ago and is
/// not in `in_flight`, the set of jobs this process is still running. Its
/// running step and the job itself are marked failed; nothing is resumed,
/// since step handlers are not assumed safe to re-run.
///
/// Returns the number of jobs reconciled.
pub async fn reconcile_stale_jobs(
    store: &dyn JobStore,
    grace: Duration,
    in_flight: &HashSet<JobId>,
) -> Result<usize, StoreError> {
    let cutoff = chrono::Duration::from_std(grace)
        .ok()
        .and_then(|grace| Utc::now().checked_sub_signed(grace))
        .ok_or_else(|| {
            StoreError::Storage(format!("recovery grace of {}s is out of range", grace.as_secs()))
        })?;

    let stale: Vec<Job> = store
        .list_running_since(cutoff)
        .await?
        .into_iter()
        .filter(|job| !in_flight.contains(&job.id))
        .collect();
    if stale.is_empty() {
        debug!("No stale running jobs found");
        return Ok(0);
    }

    let mut reconciled = 0;
    for job in stale {
        warn!(
            job_id = %job.id,
            kind = %job.kind,
            "Found stale running job claimed at {:?}, marking interrupted",
            job.started_at
        );

        match interrupt(store, &job, INTERRUPTED_STEP_ERROR, INTERRUPTED_JOB_ERROR).await {
            Ok(()) => reconciled += 1,
            Err(e) => error!(job_id = %job.id, "Failed to reconcile stale job: {}", e),
        }
    }

    info!("Reconciled {} stale running jobs", reconciled);
    Ok(reconciled)
}

/// Mark the job's running steps and then the job itself failed.
pub async fn interrupt(
    store: &dyn JobStore,
    job: &Job,
    step_error: &str,
    job_error: &str,
) -> Result<(), StoreError> {
    for step in job.steps.iter().filter(|s| s.status == StepStatus::Running) {
        store
            .update_step(job.id, &step.key, StepUpdate::failed(step_error))
            .await?;
    }
    store
        .finish(job.id, JobStatus::Failed, Some(job_error.to_string()))
        .await?;
    Ok(())
}
