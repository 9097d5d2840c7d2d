use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Pool, Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use crate::db::models::{JobRow, StepRow};
use crate::jobs::store::{cancel_target, check_finish};
use crate::jobs::{Job, JobFilter, JobId, JobKind, JobStatus, JobStore, NewJob, StepUpdate, StoreError};

macro_rules! job_columns {
    () => {
        "id, kind, status, subject, exclusivity_key, payload, triggered_by, \
         cancel_requested, cancel_reason, error, created_at, started_at, finished_at"
    };
}

const SELECT_JOB: &str = concat!("SELECT ", job_columns!(), " FROM jobs WHERE id = $1");

const SELECT_JOB_FOR_UPDATE: &str =
    concat!("SELECT ", job_columns!(), " FROM jobs WHERE id = $1 FOR UPDATE");

const SELECT_STEPS: &str = "SELECT job_id, key, label, status, error, result, started_at, finished_at \
     FROM job_steps WHERE job_id = ANY($1) ORDER BY job_id, position";

/// Postgres-backed job store.
///
/// Exclusivity between active jobs is enforced by the partial unique index
/// on `jobs.exclusivity_key`; claims use `FOR UPDATE SKIP LOCKED` so two
/// workers never take the same row.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Attach step rows to job rows, preserving the job order.
    async fn hydrate(&self, rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let step_rows = sqlx::query_as::<_, StepRow>(SELECT_STEPS)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;

        let mut by_job: HashMap<Uuid, Vec<StepRow>> = HashMap::new();
        for step in step_rows {
            by_job.entry(step.job_id).or_default().push(step);
        }

        rows.into_iter()
            .map(|row| {
                let steps = by_job.remove(&row.id).unwrap_or_default();
                row.into_job(steps)
            })
            .collect()
    }

    async fn hydrate_one(&self, row: JobRow) -> Result<Job, StoreError> {
        let id = JobId(row.id);
        self.hydrate(vec![row])
            .await?
            .pop()
            .ok_or(StoreError::NotFound(id))
    }

    /// Lock a job row for the rest of the transaction.
    async fn lock_row(conn: &mut PgConnection, job_id: JobId) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(SELECT_JOB_FOR_UPDATE)
            .bind(job_id.0)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        row.into_job(Vec::new())
    }
}

fn map_unique_violation(err: sqlx::Error, key: &Option<String>) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::Conflict(key.clone().unwrap_or_default());
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let job = new_job.into_job(Utc::now());
        debug!("Creating job: kind={}, status={}", job.kind, job.status);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, status, subject, exclusivity_key, payload,
                              triggered_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            "#,
        )
        .bind(job.id.0)
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(&job.subject)
        .bind(&job.exclusivity_key)
        .bind(&job.payload)
        .bind(&job.triggered_by)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, &job.exclusivity_key))?;

        for (position, step) in job.steps.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO job_steps (job_id, position, key, label, status)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(job.id.0)
            .bind(position as i32)
            .bind(&step.key)
            .bind(&step.label)
            .bind(step.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Job created with id={}", job.id);
        Ok(job)
    }

    async fn submit(&self, job_id: JobId) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let job = Self::lock_row(&mut *tx, job_id).await?;
        if job.status != JobStatus::Planned {
            return Err(StoreError::InvalidState {
                job_id,
                current: job.status,
                action: "submit",
            });
        }

        sqlx::query("UPDATE jobs SET status = 'pending', updated_at = now() WHERE id = $1")
            .bind(job_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique_violation(e, &job.exclusivity_key))?;
        tx.commit().await?;

        self.get(job_id).await
    }

    async fn claim_next(&self, kind: JobKind) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(concat!(
            "UPDATE jobs SET status = 'running', started_at = now(), updated_at = now() \
             WHERE status = 'pending' AND id = ( \
                 SELECT id FROM jobs WHERE kind = $1 AND status = 'pending' \
                 ORDER BY created_at, id LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING ",
            job_columns!()
        ))
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_one(row).await?)),
            None => Ok(None),
        }
    }

    async fn update_step(
        &self,
        job_id: JobId,
        step_key: &str,
        update: StepUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let job = Self::lock_row(&mut *tx, job_id).await?;
        if job.status.is_terminal() {
            return Err(StoreError::InvalidState {
                job_id,
                current: job.status,
                action: "update a step",
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE job_steps
            SET status = $3,
                error = $4,
                result = COALESCE($5, result),
                started_at = CASE WHEN $3 = 'running' THEN now() ELSE started_at END,
                finished_at = CASE WHEN $3 IN ('completed', 'failed') THEN now() ELSE finished_at END
            WHERE job_id = $1 AND key = $2
            "#,
        )
        .bind(job_id.0)
        .bind(step_key)
        .bind(update.status.as_str())
        .bind(&update.error)
        .bind(&update.result)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StepNotFound {
                job_id,
                step: step_key.to_string(),
            });
        }

        sqlx::query("UPDATE jobs SET updated_at = now() WHERE id = $1")
            .bind(job_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let job = Self::lock_row(&mut *tx, job_id).await?;

        if check_finish(&job, status)? {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = $2, error = $3, finished_at = now(), updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(job_id.0)
            .bind(status.as_str())
            .bind(&error)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get(job_id).await
    }

    async fn request_cancel(
        &self,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let job = Self::lock_row(&mut *tx, job_id).await?;
        let target = cancel_target(&job)?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET cancel_requested = TRUE,
                cancel_reason = $2,
                status = $3,
                finished_at = CASE WHEN $3 = 'cancelled' THEN now() ELSE finished_at END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id.0)
        .bind(&reason)
        .bind(target.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get(job_id).await
    }

    async fn is_cancel_requested(&self, job_id: JobId) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT cancel_requested FROM jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn get(&self, job_id: JobId) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(SELECT_JOB)
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        self.hydrate_one(row).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(concat!("SELECT ", job_columns!(), " FROM jobs WHERE TRUE"));
        if let Some(kind) = filter.kind {
            query.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(subject) = &filter.subject {
            query.push(" AND subject = ").push_bind(subject.clone());
        }
        query.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query.build_query_as::<JobRow>().fetch_all(&self.pool).await?;
        self.hydrate(rows).await
    }

    async fn list_running_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE status = 'running' \
              AND (started_at IS NULL OR started_at < $1) \
              ORDER BY started_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// These run against a real Postgres: `DATABASE_URL=... cargo test -- --ignored`.
/// `sqlx::test` creates a throwaway database per test and applies `migrations/`.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::snapshot;
    use crate::jobs::types::{ConcurrencyPolicy, StepDef, StepStatus};
    use sqlx::PgPool;

    const STEPS: [StepDef; 2] = [StepDef::new("first", "First"), StepDef::new("second", "Second")];

    fn restore_job(vm: &str, initial_status: JobStatus, policy: ConcurrencyPolicy) -> NewJob {
        NewJob {
            kind: JobKind::Restore,
            initial_status,
            subject: Some(vm.to_string()),
            exclusivity_key: policy.exclusivity_key(JobKind::Restore, Some(vm)),
            payload: serde_json::json!({"vm_id": vm}),
            triggered_by: "bob".into(),
            steps: STEPS.to_vec(),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn singleton_conflict_comes_from_the_unique_index(pool: PgPool) {
        let store = PgJobStore::new(pool);
        let first = store.create(snapshot::new_job("alice")).await.unwrap();

        let err = store.create(snapshot::new_job("bob")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ref key) if key == "snapshot_pipeline"));
        assert_eq!(store.list(&JobFilter::default()).await.unwrap().len(), 1);

        store.claim_next(JobKind::SnapshotPipeline).await.unwrap().unwrap();
        assert!(matches!(
            store.create(snapshot::new_job("bob")).await,
            Err(StoreError::Conflict(_))
        ));

        store.finish(first.id, JobStatus::Completed, None).await.unwrap();
        store.create(snapshot::new_job("bob")).await.unwrap();
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn submit_takes_the_per_vm_lock(pool: PgPool) {
        let store = PgJobStore::new(pool);
        let policy = ConcurrencyPolicy::PerSubject;
        let a = store.create(restore_job("vm-1", JobStatus::Planned, policy)).await.unwrap();
        let b = store.create(restore_job("vm-1", JobStatus::Planned, policy)).await.unwrap();
        let other = store.create(restore_job("vm-2", JobStatus::Planned, policy)).await.unwrap();

        let submitted = store.submit(a.id).await.unwrap();
        assert_eq!(submitted.status, JobStatus::Pending);
        assert!(matches!(store.submit(b.id).await, Err(StoreError::Conflict(_))));
        assert_eq!(store.get(b.id).await.unwrap().status, JobStatus::Planned);
        store.submit(other.id).await.unwrap();

        assert!(matches!(
            store.submit(a.id).await,
            Err(StoreError::InvalidState { current: JobStatus::Pending, .. })
        ));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn claim_is_oldest_first_and_never_doubles_up(pool: PgPool) {
        let store = PgJobStore::new(pool);
        let policy = ConcurrencyPolicy::Unrestricted;
        let a = store.create(restore_job("vm-a", JobStatus::Pending, policy)).await.unwrap();
        let b = store.create(restore_job("vm-b", JobStatus::Pending, policy)).await.unwrap();
        store.create(restore_job("vm-c", JobStatus::Planned, policy)).await.unwrap();

        let claimed = store.claim_next(JobKind::Restore).await.unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());
        assert_eq!(claimed.steps.len(), 2);
        assert_eq!(claimed.steps[0].key, "first");

        let (left, right) = tokio::join!(
            store.claim_next(JobKind::Restore),
            store.claim_next(JobKind::Restore)
        );
        let claims: Vec<_> = [left.unwrap(), right.unwrap()].into_iter().flatten().collect();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].id, b.id);

        assert!(store.claim_next(JobKind::Restore).await.unwrap().is_none());
        assert!(store.claim_next(JobKind::SnapshotPipeline).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn steps_record_results_and_finish_is_idempotent(pool: PgPool) {
        let store = PgJobStore::new(pool);
        let job = store.create(snapshot::new_job("alice")).await.unwrap();
        store.claim_next(JobKind::SnapshotPipeline).await.unwrap().unwrap();

        assert!(matches!(
            store.update_step(job.id, "nope", StepUpdate::running()).await,
            Err(StoreError::StepNotFound { .. })
        ));

        let key = snapshot::POLICY_ASSIGN;
        store.update_step(job.id, key, StepUpdate::running()).await.unwrap();
        store
            .update_step(job.id, key, StepUpdate::completed(Some(serde_json::json!({"assigned": 3}))))
            .await
            .unwrap();
        let stored = store.get(job.id).await.unwrap();
        let step = stored.step(key).unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.started_at.is_some() && step.finished_at.is_some());
        assert_eq!(stored.step_result(key), Some(&serde_json::json!({"assigned": 3})));
        assert!(stored.steps_well_ordered());

        let done = store.finish(job.id, JobStatus::Failed, Some("boom".into())).await.unwrap();
        let again = store.finish(job.id, JobStatus::Failed, None).await.unwrap();
        assert_eq!(again.finished_at, done.finished_at);
        assert_eq!(again.error.as_deref(), Some("boom"));
        assert!(matches!(
            store.finish(job.id, JobStatus::Completed, None).await,
            Err(StoreError::InvalidState { .. })
        ));
        assert!(matches!(
            store.update_step(job.id, key, StepUpdate::running()).await,
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn cancel_depends_on_status(pool: PgPool) {
        let store = PgJobStore::new(pool);
        let policy = ConcurrencyPolicy::PerSubject;
        let planned = store.create(restore_job("vm-p", JobStatus::Planned, policy)).await.unwrap();
        let running = store.create(restore_job("vm-r", JobStatus::Pending, policy)).await.unwrap();
        store.claim_next(JobKind::Restore).await.unwrap().unwrap();

        let cancelled = store.request_cancel(planned.id, Some("wrong point".into())).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("wrong point"));
        assert!(cancelled.finished_at.is_some());

        let flagged = store.request_cancel(running.id, None).await.unwrap();
        assert_eq!(flagged.status, JobStatus::Running);
        assert!(store.is_cancel_requested(running.id).await.unwrap());
        assert!(flagged.finished_at.is_none());

        assert!(matches!(
            store.request_cancel(planned.id, None).await,
            Err(StoreError::InvalidState { .. })
        ));
        assert!(matches!(
            store.is_cancel_requested(JobId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn list_filters_and_running_since(pool: PgPool) {
        let store = PgJobStore::new(pool);
        let policy = ConcurrencyPolicy::Unrestricted;
        let a = store.create(restore_job("vm-a", JobStatus::Pending, policy)).await.unwrap();
        let b = store.create(restore_job("vm-b", JobStatus::Planned, policy)).await.unwrap();
        store.create(snapshot::new_job("alice")).await.unwrap();

        let restores = store.list(&JobFilter::kind(JobKind::Restore)).await.unwrap();
        assert_eq!(restores.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b.id, a.id]);

        let planned = store
            .list(&JobFilter::kind(JobKind::Restore).with_status(JobStatus::Planned))
            .await
            .unwrap();
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].id, b.id);

        let for_vm = store
            .list(&JobFilter::kind(JobKind::Restore).with_subject("vm-a").with_limit(5))
            .await
            .unwrap();
        assert_eq!(for_vm.len(), 1);
        assert_eq!(for_vm[0].payload, serde_json::json!({"vm_id": "vm-a"}));

        assert_eq!(store.list(&JobFilter::default().with_limit(1)).await.unwrap().len(), 1);

        store.claim_next(JobKind::Restore).await.unwrap().unwrap();
        let future = Utc::now() + chrono::Duration::seconds(60);
        let stale = store.list_running_since(future).await.unwrap();
        assert_eq!(stale.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a.id]);
        let past = Utc::now() - chrono::Duration::seconds(60);
        assert!(store.list_running_since(past).await.unwrap().is_empty());

        store.ping().await.unwrap();
    }
}
