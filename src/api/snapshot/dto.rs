use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::jobs::{Job, JobId, JobStatus, Step};

/// Response for a pipeline trigger
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub message: String,
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Snapshot pipeline status; `status` is `idle` when no run exists
#[derive(Debug, Serialize)]
pub struct PipelineStatus {
    pub job_id: Option<JobId>,
    pub status: String,
    pub triggered_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<Step>,
}

impl PipelineStatus {
    pub fn idle() -> Self {
        Self {
            job_id: None,
            status: "idle".to_string(),
            triggered_by: None,
            created_at: None,
            started_at: None,
            finished_at: None,
            error: None,
            steps: Vec::new(),
        }
    }
}

impl From<Job> for PipelineStatus {
    fn from(job: Job) -> Self {
        Self {
            job_id: Some(job.id),
            status: job.status.to_string(),
            triggered_by: Some(job.triggered_by),
            created_at: Some(job.created_at),
            started_at: job.started_at,
            finished_at: job.finished_at,
            error: job.error,
            steps: job.steps,
        }
    }
}
