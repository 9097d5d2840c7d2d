//! In-memory job store for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::store::{cancel_target, check_finish, JobStore, StoreError};
use super::types::{Job, JobFilter, JobId, JobKind, JobStatus, NewJob, StepUpdate};

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .lock()
            .map_err(|_| StoreError::Storage("job table lock poisoned".to_string()))
    }
}

fn holds_key(jobs: &HashMap<JobId, Job>, key: &Option<String>, except: Option<JobId>) -> bool {
    let Some(key) = key else {
        return false;
    };
    jobs.values().any(|j| {
        Some(j.id) != except && j.status.is_active() && j.exclusivity_key.as_ref() == Some(key)
    })
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.lock()?;
        let job = new_job.into_job(Utc::now());
        if job.status.is_active() && holds_key(&jobs, &job.exclusivity_key, None) {
            return Err(StoreError::Conflict(
                job.exclusivity_key.clone().unwrap_or_default(),
            ));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn submit(&self, job_id: JobId) -> Result<Job, StoreError> {
        let mut jobs = self.lock()?;
        let job = jobs.get(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status != JobStatus::Planned {
            return Err(StoreError::InvalidState {
                job_id,
                current: job.status,
                action: "submit",
            });
        }
        if holds_key(&jobs, &job.exclusivity_key, Some(job_id)) {
            return Err(StoreError::Conflict(
                job.exclusivity_key.clone().unwrap_or_default(),
            ));
        }
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        job.status = JobStatus::Pending;
        Ok(job.clone())
    }

    async fn claim_next(&self, kind: JobKind) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.lock()?;
        let next = jobs
            .values()
            .filter(|j| j.kind == kind && j.status == JobStatus::Pending)
            .min_by_key(|j| (j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(next.and_then(|id| jobs.get_mut(&id)).map(|job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.clone()
        }))
    }

    async fn update_step(
        &self,
        job_id: JobId,
        step_key: &str,
        update: StepUpdate,
    ) -> Result<(), StoreError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(StoreError::InvalidState {
                job_id,
                current: job.status,
                action: "update a step",
            });
        }
        let step = job
            .steps
            .iter_mut()
            .find(|s| s.key == step_key)
            .ok_or_else(|| StoreError::StepNotFound {
                job_id,
                step: step_key.to_string(),
            })?;
        update.apply(step, Utc::now());
        Ok(())
    }

    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if check_finish(job, status)? {
            job.status = status;
            job.error = error;
            job.finished_at = Some(Utc::now());
        }
        Ok(job.clone())
    }

    async fn request_cancel(
        &self,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let target = cancel_target(job)?;
        job.cancel_requested = true;
        job.cancel_reason = reason;
        if target == JobStatus::Cancelled {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(Utc::now());
        }
        Ok(job.clone())
    }

    async fn is_cancel_requested(&self, job_id: JobId) -> Result<bool, StoreError> {
        let jobs = self.lock()?;
        jobs.get(&job_id)
            .map(|j| j.cancel_requested)
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn get(&self, job_id: JobId) -> Result<Job, StoreError> {
        let jobs = self.lock()?;
        jobs.get(&job_id).cloned().ok_or(StoreError::NotFound(job_id))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.lock()?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        result.sort_by(|a, b| (b.created_at, b.id.0).cmp(&(a.created_at, a.id.0)));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn list_running_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.lock()?;
        Ok(jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.started_at.map_or(true, |t| t < cutoff))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{ConcurrencyPolicy, StepDef, StepStatus};

    const STEPS: [StepDef; 2] = [StepDef::new("first", "First"), StepDef::new("second", "Second")];

    fn snapshot_job() -> NewJob {
        NewJob {
            kind: JobKind::SnapshotPipeline,
            initial_status: JobStatus::Pending,
            subject: None,
            exclusivity_key: ConcurrencyPolicy::Singleton
                .exclusivity_key(JobKind::SnapshotPipeline, None),
            payload: serde_json::json!({}),
            triggered_by: "alice".into(),
            steps: STEPS.to_vec(),
        }
    }

    fn restore_plan(vm: &str) -> NewJob {
        NewJob {
            kind: JobKind::Restore,
            initial_status: JobStatus::Planned,
            subject: Some(vm.to_string()),
            exclusivity_key: ConcurrencyPolicy::PerSubject
                .exclusivity_key(JobKind::Restore, Some(vm)),
            payload: serde_json::json!({}),
            triggered_by: "bob".into(),
            steps: STEPS.to_vec(),
        }
    }

    #[tokio::test]
    async fn second_singleton_job_conflicts_while_first_is_active() {
        let store = InMemoryJobStore::new();
        let first = store.create(snapshot_job()).await.unwrap();

        let err = store.create(snapshot_job()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.list(&JobFilter::default()).await.unwrap().len(), 1);

        store.claim_next(JobKind::SnapshotPipeline).await.unwrap().unwrap();
        assert!(matches!(
            store.create(snapshot_job()).await,
            Err(StoreError::Conflict(_))
        ));

        store.finish(first.id, JobStatus::Completed, None).await.unwrap();
        store.create(snapshot_job()).await.unwrap();
    }

    #[tokio::test]
    async fn claim_takes_oldest_pending_and_marks_running() {
        let store = InMemoryJobStore::new();
        let a = store.create(restore_plan("vm-a")).await.unwrap();
        let b = store.create(restore_plan("vm-b")).await.unwrap();
        store.submit(a.id).await.unwrap();
        store.submit(b.id).await.unwrap();

        let claimed = store.claim_next(JobKind::Restore).await.unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        let claimed = store.claim_next(JobKind::Restore).await.unwrap().unwrap();
        assert_eq!(claimed.id, b.id);
        assert!(store.claim_next(JobKind::Restore).await.unwrap().is_none());
        assert!(store.claim_next(JobKind::SnapshotPipeline).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn planned_jobs_are_not_claimable() {
        let store = InMemoryJobStore::new();
        store.create(restore_plan("vm-1")).await.unwrap();
        assert!(store.claim_next(JobKind::Restore).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn per_subject_lock_applies_at_submit() {
        let store = InMemoryJobStore::new();
        let a = store.create(restore_plan("vm-1")).await.unwrap();
        let b = store.create(restore_plan("vm-1")).await.unwrap();
        let other = store.create(restore_plan("vm-2")).await.unwrap();

        store.submit(a.id).await.unwrap();
        assert!(matches!(store.submit(b.id).await, Err(StoreError::Conflict(_))));
        assert_eq!(store.get(b.id).await.unwrap().status, JobStatus::Planned);
        store.submit(other.id).await.unwrap();
    }

    #[tokio::test]
    async fn submit_requires_planned() {
        let store = InMemoryJobStore::new();
        let job = store.create(snapshot_job()).await.unwrap();
        let err = store.submit(job.id).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidState {
                current: JobStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn finish_is_idempotent_for_the_same_status_only() {
        let store = InMemoryJobStore::new();
        let job = store.create(snapshot_job()).await.unwrap();
        store.claim_next(JobKind::SnapshotPipeline).await.unwrap();

        let done = store.finish(job.id, JobStatus::Failed, Some("boom".into())).await.unwrap();
        let finished_at = done.finished_at;
        let again = store.finish(job.id, JobStatus::Failed, None).await.unwrap();
        assert_eq!(again.finished_at, finished_at);
        assert_eq!(again.error.as_deref(), Some("boom"));

        assert!(matches!(
            store.finish(job.id, JobStatus::Completed, None).await,
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn update_step_reports_missing_job_and_step() {
        let store = InMemoryJobStore::new();
        let job = store.create(snapshot_job()).await.unwrap();

        assert!(matches!(
            store.update_step(JobId::new(), "first", StepUpdate::running()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update_step(job.id, "nope", StepUpdate::running()).await,
            Err(StoreError::StepNotFound { .. })
        ));

        store.update_step(job.id, "first", StepUpdate::running()).await.unwrap();
        let job = store.get(job.id).await.unwrap();
        assert_eq!(job.steps[0].status, StepStatus::Running);
        assert!(job.steps[0].started_at.is_some());
    }

    #[tokio::test]
    async fn cancel_pending_is_immediate_and_running_is_flagged() {
        let store = InMemoryJobStore::new();
        let a = store.create(restore_plan("vm-a")).await.unwrap();
        let b = store.create(restore_plan("vm-b")).await.unwrap();
        store.submit(a.id).await.unwrap();
        store.submit(b.id).await.unwrap();
        store.claim_next(JobKind::Restore).await.unwrap();

        let running = store.request_cancel(a.id, Some("wrong vm".into())).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(store.is_cancel_requested(a.id).await.unwrap());

        let pending = store.request_cancel(b.id, None).await.unwrap();
        assert_eq!(pending.status, JobStatus::Cancelled);
        assert!(pending.finished_at.is_some());

        assert!(matches!(
            store.request_cancel(b.id, None).await,
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let store = InMemoryJobStore::new();
        let a = store.create(restore_plan("vm-a")).await.unwrap();
        let b = store.create(restore_plan("vm-b")).await.unwrap();
        store.create(snapshot_job()).await.unwrap();

        let restores = store.list(&JobFilter::kind(JobKind::Restore)).await.unwrap();
        assert_eq!(
            restores.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![b.id, a.id]
        );

        let for_vm = store
            .list(&JobFilter::kind(JobKind::Restore).with_subject("vm-a"))
            .await
            .unwrap();
        assert_eq!(for_vm.len(), 1);
        assert_eq!(for_vm[0].id, a.id);

        let limited = store.list(&JobFilter::default().with_limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
