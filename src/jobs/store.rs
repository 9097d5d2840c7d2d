//! Job store abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{Job, JobFilter, JobId, JobKind, JobStatus, NewJob, StepUpdate};

/// Job store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("step {step} not found on job {job_id}")]
    StepNotFound { job_id: JobId, step: String },
    /// An active job already holds the exclusivity key
    #[error("conflicting active job: {0}")]
    Conflict(String),
    #[error("job {job_id} is {current}, cannot {action}")]
    InvalidState {
        job_id: JobId,
        current: JobStatus,
        action: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable table of jobs and their steps.
///
/// Every mutation is atomic per job row. Implementations must make
/// `create`, `submit` and `claim_next` safe under concurrent callers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job in its initial status with its fixed step list.
    ///
    /// Fails with `Conflict` when the job would be active and another active
    /// job already holds the same exclusivity key.
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError>;

    /// Move a `planned` job to `pending`, making it claimable.
    async fn submit(&self, job_id: JobId) -> Result<Job, StoreError>;

    /// Atomically claim the oldest `pending` job of `kind`, marking it `running`.
    async fn claim_next(&self, kind: JobKind) -> Result<Option<Job>, StoreError>;

    /// Persist one step's status.
    async fn update_step(
        &self,
        job_id: JobId,
        step_key: &str,
        update: StepUpdate,
    ) -> Result<(), StoreError>;

    /// Write a terminal status.
    ///
    /// Repeating the call with the job's current terminal status is a no-op;
    /// any other status on a terminal job is `InvalidState`.
    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, StoreError>;

    /// Cancel immediately when `planned`/`pending`, flag for cooperative
    /// cancellation when `running`.
    async fn request_cancel(
        &self,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<Job, StoreError>;

    async fn is_cancel_requested(&self, job_id: JobId) -> Result<bool, StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Job, StoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// `running` jobs claimed before `cutoff`.
    async fn list_running_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Validates a `finish` request against the job's current status.
///
/// Returns `Ok(true)` when the write should happen and `Ok(false)` when the
/// job already carries the requested terminal status.
pub(crate) fn check_finish(job: &Job, status: JobStatus) -> Result<bool, StoreError> {
    if !status.is_terminal() {
        return Err(StoreError::InvalidState {
            job_id: job.id,
            current: job.status,
            action: "finish with a non-terminal status",
        });
    }
    if job.status == status {
        return Ok(false);
    }
    if !job.status.can_transition_to(status) {
        return Err(StoreError::InvalidState {
            job_id: job.id,
            current: job.status,
            action: "finish",
        });
    }
    Ok(true)
}

/// Validates a cancel request, returning the status the job moves to.
pub(crate) fn cancel_target(job: &Job) -> Result<JobStatus, StoreError> {
    match job.status {
        JobStatus::Planned | JobStatus::Pending => Ok(JobStatus::Cancelled),
        JobStatus::Running => Ok(JobStatus::Running),
        current => Err(StoreError::InvalidState {
            job_id: job.id,
            current,
            action: "cancel",
        }),
    }
}
