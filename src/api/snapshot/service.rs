use std::sync::Arc;

use tracing::info;

use crate::api::error::ServiceError;
use crate::jobs::{snapshot, Job, JobFilter, JobId, JobKind, JobStore, StoreError};

/// Triggers and reports on snapshot pipeline runs
pub struct SnapshotService {
    store: Arc<dyn JobStore>,
}

impl SnapshotService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Queue a new pipeline run.
    ///
    /// Rejected with `Conflict` while another run is pending or running;
    /// the second trigger is never queued.
    pub async fn trigger(&self, triggered_by: &str) -> Result<Job, ServiceError> {
        info!("Service: snapshot pipeline triggered by {}", triggered_by);

        let job = self
            .store
            .create(snapshot::new_job(triggered_by))
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => ServiceError::Conflict(
                    "a snapshot pipeline run is already pending or running".to_string(),
                ),
                other => other.into(),
            })?;

        info!("Service: snapshot pipeline queued with id={}", job.id);
        Ok(job)
    }

    /// Most recent run, if any
    pub async fn latest(&self) -> Result<Option<Job>, ServiceError> {
        let mut jobs = self
            .store
            .list(&JobFilter::kind(JobKind::SnapshotPipeline).with_limit(1))
            .await?;
        Ok(jobs.pop())
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job, ServiceError> {
        let job = self.store.get(job_id).await?;
        if job.kind != JobKind::SnapshotPipeline {
            return Err(ServiceError::NotFound(job_id));
        }
        Ok(job)
    }
}
