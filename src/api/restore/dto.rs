use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::jobs::restore::{IpStrategy, PlanRequest, RestoreMode, RestorePlan};
use crate::jobs::Job;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 200;

#[derive(Debug, Deserialize, Validate)]
pub struct PlanRestoreRequest {
    #[validate(length(min = 1, message = "project_id is required"))]
    pub project_id: String,
    #[validate(length(min = 1, message = "vm_id is required"))]
    pub vm_id: String,
    #[validate(length(min = 1, message = "restore_point_id is required"))]
    pub restore_point_id: String,
    pub mode: RestoreMode,
    pub ip_strategy: IpStrategy,
    #[validate(length(max = 255, message = "new_vm_name must be at most 255 characters"))]
    pub new_vm_name: Option<String>,
}

impl From<PlanRestoreRequest> for PlanRequest {
    fn from(req: PlanRestoreRequest) -> Self {
        PlanRequest {
            project_id: req.project_id,
            vm_id: req.vm_id,
            restore_point_id: req.restore_point_id,
            mode: req.mode,
            ip_strategy: req.ip_strategy,
            new_vm_name: req.new_vm_name,
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ExecuteRestoreRequest {
    /// Must equal the plan's confirmation phrase for REPLACE restores
    #[validate(length(max = 512))]
    pub confirm_destructive: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CancelRestoreRequest {
    #[validate(length(max = 1024, message = "reason must be at most 1024 characters"))]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRestoresQuery {
    pub status: Option<String>,
    pub vm_id: Option<String>,
    pub limit: Option<usize>,
}

impl ListRestoresQuery {
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

/// Response for a freshly planned restore
#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub message: String,
    /// Phrase to send as `confirm_destructive`; only set for REPLACE
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_phrase: Option<String>,
    pub plan: RestorePlan,
    pub job: Job,
}

impl PlanResponse {
    pub fn new(job: Job, plan: RestorePlan) -> Self {
        let confirmation_phrase =
            (plan.mode == RestoreMode::Replace).then(|| plan.confirmation_phrase());
        Self {
            message: "Restore planned; nothing has been changed yet".to_string(),
            confirmation_phrase,
            plan,
            job,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RestoreJobResponse {
    pub message: String,
    pub job: Job,
}

#[derive(Debug, Serialize)]
pub struct RestoreListResponse {
    pub count: usize,
    pub jobs: Vec<Job>,
}
