//! Job and step records shared by the store, the engine and the API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned when a persisted enum column holds an unknown value.
#[derive(Debug, thiserror::Error)]
#[error("unknown {what}: {value}")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SnapshotPipeline,
    Restore,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::SnapshotPipeline, JobKind::Restore];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SnapshotPipeline => "snapshot_pipeline",
            JobKind::Restore => "restore",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot_pipeline" => Ok(JobKind::SnapshotPipeline),
            "restore" => Ok(JobKind::Restore),
            other => Err(ParseEnumError {
                what: "job kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Stored job status.
///
/// Transitions only move forward:
/// `planned -> pending -> running -> {completed | failed | cancelled}`,
/// with `planned` and `pending` also allowed to go straight to `cancelled`.
/// `idle` is never stored; the API reports it when no job exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Restore plan validated, waiting for an explicit execute call
    Planned,
    /// Claimable by the worker
    Pending,
    /// Claimed and being driven through its steps
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Planned => "planned",
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses that hold a kind's exclusivity key.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Planned => 0,
            JobStatus::Pending => 1,
            JobStatus::Running => 2,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 3,
        }
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == JobStatus::Cancelled {
            return true;
        }
        match next {
            JobStatus::Completed | JobStatus::Failed => *self == JobStatus::Running,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(JobStatus::Planned),
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(ParseEnumError {
                what: "job status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(ParseEnumError {
                what: "step status",
                value: other.to_string(),
            }),
        }
    }
}

/// Static description of a step, used to seed a job's step list at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDef {
    pub key: &'static str,
    pub label: &'static str,
}

impl StepDef {
    pub const fn new(key: &'static str, label: &'static str) -> Self {
        Self { key, label }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub key: String,
    pub label: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Output recorded by the handler, readable by later steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&StepDef> for Step {
    fn from(def: &StepDef) -> Self {
        Self {
            key: def.key.to_string(),
            label: def.label.to_string(),
            status: StepStatus::Pending,
            error: None,
            result: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A single status change for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub status: StepStatus,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl StepUpdate {
    pub fn running() -> Self {
        Self {
            status: StepStatus::Running,
            error: None,
            result: None,
        }
    }

    pub fn completed(result: Option<serde_json::Value>) -> Self {
        Self {
            status: StepStatus::Completed,
            error: None,
            result,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            error: Some(error.into()),
            result: None,
        }
    }

    /// Apply this update to an in-memory step, stamping timestamps.
    pub fn apply(&self, step: &mut Step, now: DateTime<Utc>) {
        step.status = self.status;
        step.error = self.error.clone();
        if self.result.is_some() {
            step.result = self.result.clone();
        }
        match self.status {
            StepStatus::Running => step.started_at = Some(now),
            StepStatus::Completed | StepStatus::Failed => step.finished_at = Some(now),
            StepStatus::Pending => {}
        }
    }
}

/// A durable job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Resource the job acts on (the original VM id for restores)
    pub subject: Option<String>,
    /// Concurrency lock held while the job is pending or running
    #[serde(skip)]
    pub exclusivity_key: Option<String>,
    pub payload: serde_json::Value,
    pub triggered_by: String,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<Step>,
}

impl Job {
    pub fn step(&self, key: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.key == key)
    }

    /// Result recorded by a completed step.
    pub fn step_result(&self, key: &str) -> Option<&serde_json::Value> {
        self.step(key)
            .filter(|s| s.status == StepStatus::Completed)
            .and_then(|s| s.result.as_ref())
    }

    /// Checks the ordering invariant over step statuses: a run of
    /// `completed`, then at most one `running` or `failed`, then only `pending`.
    pub fn steps_well_ordered(&self) -> bool {
        let mut iter = self.steps.iter().map(|s| s.status).peekable();
        while iter.peek() == Some(&StepStatus::Completed) {
            iter.next();
        }
        if matches!(iter.peek(), Some(StepStatus::Running | StepStatus::Failed)) {
            iter.next();
        }
        iter.all(|s| s == StepStatus::Pending)
    }
}

/// Everything needed to insert a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    /// `Pending` for directly runnable jobs, `Planned` for restore plans
    pub initial_status: JobStatus,
    pub subject: Option<String>,
    pub exclusivity_key: Option<String>,
    pub payload: serde_json::Value,
    pub triggered_by: String,
    pub steps: Vec<StepDef>,
}

impl NewJob {
    /// Materialize the record the store will hold.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            kind: self.kind,
            status: self.initial_status,
            subject: self.subject,
            exclusivity_key: self.exclusivity_key,
            payload: self.payload,
            triggered_by: self.triggered_by,
            cancel_requested: false,
            cancel_reason: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            steps: self.steps.iter().map(Step::from).collect(),
        }
    }
}

/// Per-kind rule for how many jobs may be active at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// At most one active job of the kind system-wide
    Singleton,
    /// At most one active job per subject
    PerSubject,
    Unrestricted,
}

impl ConcurrencyPolicy {
    pub fn exclusivity_key(&self, kind: JobKind, subject: Option<&str>) -> Option<String> {
        match (self, subject) {
            (ConcurrencyPolicy::Singleton, _) => Some(kind.as_str().to_string()),
            (ConcurrencyPolicy::PerSubject, Some(subject)) => {
                Some(format!("{}:{}", kind.as_str(), subject))
            }
            (ConcurrencyPolicy::PerSubject, None) | (ConcurrencyPolicy::Unrestricted, _) => None,
        }
    }
}

/// Filters for listing jobs. Results are ordered newest first.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub subject: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn kind(kind: JobKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.kind.map_or(true, |k| job.kind == k)
            && self.status.map_or(true, |s| job.status == s)
            && self
                .subject
                .as_deref()
                .map_or(true, |s| job.subject.as_deref() == Some(s))
    }
}
