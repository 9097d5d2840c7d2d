use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::jobs::{Job, JobId, Step, StoreError};

/// Database representation of a job row
#[derive(Debug, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub kind: String,
    pub status: String,
    pub subject: Option<String>,
    pub exclusivity_key: Option<String>,
    pub payload: serde_json::Value,
    pub triggered_by: String,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Database representation of a step row
#[derive(Debug, FromRow)]
pub struct StepRow {
    pub job_id: Uuid,
    pub key: String,
    pub label: String,
    pub status: String,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(format!("corrupt row: {}", err))
}

impl TryFrom<StepRow> for Step {
    type Error = StoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(Step {
            key: row.key,
            label: row.label,
            status: row.status.parse().map_err(corrupt)?,
            error: row.error,
            result: row.result,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

impl JobRow {
    /// Assemble the domain record; `steps` must already be in position order.
    pub fn into_job(self, steps: Vec<StepRow>) -> Result<Job, StoreError> {
        Ok(Job {
            id: JobId(self.id),
            kind: self.kind.parse().map_err(corrupt)?,
            status: self.status.parse().map_err(corrupt)?,
            subject: self.subject,
            exclusivity_key: self.exclusivity_key,
            payload: self.payload,
            triggered_by: self.triggered_by,
            cancel_requested: self.cancel_requested,
            cancel_reason: self.cancel_reason,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            steps: steps
                .into_iter()
                .map(Step::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}
