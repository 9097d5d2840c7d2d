use std::sync::Arc;

use tracing::{info, warn};

use super::dto::ListRestoresQuery;
use crate::api::error::ServiceError;
use crate::jobs::restore::{self, PlanError, PlanRequest, RestorePlan, RestoreSettings};
use crate::jobs::{Job, JobFilter, JobId, JobKind, JobStatus, JobStore, StoreError};
use crate::platform::Inventory;

/// Plans, executes and cancels VM restores
pub struct RestoreService {
    store: Arc<dyn JobStore>,
    inventory: Arc<dyn Inventory>,
    settings: RestoreSettings,
}

impl RestoreService {
    pub fn new(
        store: Arc<dyn JobStore>,
        inventory: Arc<dyn Inventory>,
        settings: RestoreSettings,
    ) -> Self {
        Self {
            store,
            inventory,
            settings,
        }
    }

    /// Validate the request against inventory and persist a `planned` job.
    ///
    /// Makes no changes on the platform.
    pub async fn plan(
        &self,
        request: PlanRequest,
        triggered_by: &str,
    ) -> Result<(Job, RestorePlan), ServiceError> {
        info!(
            "Service: planning {:?} restore of VM {} from {} for {}",
            request.mode, request.vm_id, request.restore_point_id, triggered_by
        );

        let plan = restore::plan(self.inventory.as_ref(), &request, &self.settings)
            .await
            .map_err(|e| match e {
                PlanError::Invalid(msg) => ServiceError::Validation(msg),
                PlanError::Platform(err) => ServiceError::Upstream(err.to_string()),
            })?;

        let new_job = plan
            .clone()
            .into_new_job(triggered_by, self.settings.policy())
            .map_err(|e| ServiceError::Store(StoreError::Storage(e.to_string())))?;
        let job = self.store.create(new_job).await?;

        info!("Service: restore planned with id={}", job.id);
        Ok((job, plan))
    }

    /// Move a planned restore to `pending` so a worker picks it up.
    ///
    /// REPLACE restores need the exact confirmation phrase; a mismatch
    /// leaves the job `planned`.
    pub async fn execute(
        &self,
        job_id: JobId,
        confirm_destructive: Option<&str>,
    ) -> Result<Job, ServiceError> {
        let job = self.get(job_id).await?;
        if job.status != JobStatus::Planned {
            return Err(ServiceError::InvalidState(format!(
                "restore {} is {}; only planned restores can be executed",
                job_id, job.status
            )));
        }

        let plan = RestorePlan::from_job(&job)
            .map_err(|e| ServiceError::Store(StoreError::Storage(e.to_string())))?;
        if let Err(msg) = plan.check_confirmation(confirm_destructive) {
            warn!(job_id = %job_id, "Restore execution refused: {}", msg);
            return Err(ServiceError::Validation(msg));
        }

        let job = self.store.submit(job_id).await.map_err(|e| match e {
            StoreError::Conflict(_) => ServiceError::Conflict(format!(
                "another restore of VM {} is already pending or running",
                plan.vm_id
            )),
            other => other.into(),
        })?;

        info!(job_id = %job_id, "Service: restore submitted for execution");
        Ok(job)
    }

    /// Cancel a restore; planned and pending jobs stop at once, running
    /// jobs stop before their next step.
    pub async fn cancel(&self, job_id: JobId, reason: Option<String>) -> Result<Job, ServiceError> {
        self.get(job_id).await?;
        let job = self.store.request_cancel(job_id, reason).await?;
        info!(job_id = %job_id, "Service: cancellation requested, status now {}", job.status);
        Ok(job)
    }

    pub async fn list(&self, query: &ListRestoresQuery) -> Result<Vec<Job>, ServiceError> {
        let mut filter = JobFilter::kind(JobKind::Restore).with_limit(query.limit());
        if let Some(status) = &query.status {
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| ServiceError::Validation(e.to_string()))?;
            filter = filter.with_status(status);
        }
        if let Some(vm_id) = &query.vm_id {
            filter = filter.with_subject(vm_id.clone());
        }
        Ok(self.store.list(&filter).await?)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job, ServiceError> {
        let job = self.store.get(job_id).await?;
        if job.kind != JobKind::Restore {
            return Err(ServiceError::NotFound(job_id));
        }
        Ok(job)
    }
}
