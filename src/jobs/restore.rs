//! VM restore: read-only planning followed by a multi-step execution.
//!
//! A plan is validated against live inventory and stored as a `planned` job.
//! Nothing touches the platform until the plan is explicitly executed. Steps
//! that already ran are not rolled back on failure or cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info, warn};

use super::engine::{StepFailure, StepHandler, StepHandlers};
use super::types::{ConcurrencyPolicy, Job, JobKind, JobStatus, NewJob, StepDef};
use crate::platform::{Inventory, NetworkAddress, PlatformError, RestoreOps, ServerSpec};

pub const CREATE_VOLUME: &str = "create_volume";
pub const DELETE_ORIGINAL_VM: &str = "delete_original_vm";
pub const PREPARE_PORTS: &str = "prepare_ports";
pub const CREATE_VM: &str = "create_vm";
pub const CLEANUP: &str = "cleanup";

const NEW_STEPS: [StepDef; 3] = [
    StepDef::new(CREATE_VOLUME, "Create volume from restore point"),
    StepDef::new(PREPARE_PORTS, "Prepare network ports"),
    StepDef::new(CREATE_VM, "Boot restored VM"),
];

const REPLACE_STEPS: [StepDef; 5] = [
    StepDef::new(CREATE_VOLUME, "Create volume from restore point"),
    StepDef::new(DELETE_ORIGINAL_VM, "Delete original VM"),
    StepDef::new(PREPARE_PORTS, "Prepare network ports"),
    StepDef::new(CREATE_VM, "Boot restored VM"),
    StepDef::new(CLEANUP, "Clean up original volume"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreMode {
    /// Boot a second VM next to the original
    New,
    /// Delete the original VM and boot the restored one in its place
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpStrategy {
    NewIps,
    TrySameIps,
    SameIpsOrFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    Keep,
    DeleteOriginalVolume,
}

impl std::str::FromStr for CleanupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(CleanupPolicy::Keep),
            "delete_original_volume" => Ok(CleanupPolicy::DeleteOriginalVolume),
            other => Err(format!("unknown cleanup policy: {}", other)),
        }
    }
}

/// Deployment-level restore settings.
#[derive(Debug, Clone)]
pub struct RestoreSettings {
    /// Appended to the original name when a NEW restore has no explicit name
    pub name_suffix: Option<String>,
    pub cleanup: CleanupPolicy,
    pub exclusive_per_vm: bool,
}

impl RestoreSettings {
    pub fn policy(&self) -> ConcurrencyPolicy {
        if self.exclusive_per_vm {
            ConcurrencyPolicy::PerSubject
        } else {
            ConcurrencyPolicy::Unrestricted
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub project_id: String,
    pub vm_id: String,
    pub restore_point_id: String,
    pub mode: RestoreMode,
    pub ip_strategy: IpStrategy,
    pub new_vm_name: Option<String>,
}

/// Validated restore plan, stored as the restore job's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorePlan {
    pub project_id: String,
    pub vm_id: String,
    pub restore_point_id: String,
    pub mode: RestoreMode,
    pub ip_strategy: IpStrategy,
    pub original_vm_name: String,
    pub new_vm_name: String,
    pub flavor_id: String,
    pub boot_volume_id: String,
    pub original_addresses: Vec<NetworkAddress>,
    pub cleanup: CleanupPolicy,
}

impl RestorePlan {
    pub fn from_job(job: &Job) -> Result<Self, serde_json::Error> {
        serde_json::from_value(job.payload.clone())
    }

    /// Exact phrase an operator must send to execute a REPLACE restore.
    pub fn confirmation_phrase(&self) -> String {
        format!("DELETE AND RESTORE {}", self.original_vm_name)
    }

    /// Destructive-action gate: REPLACE requires the exact phrase.
    pub fn check_confirmation(&self, confirm: Option<&str>) -> Result<(), String> {
        if self.mode != RestoreMode::Replace {
            return Ok(());
        }
        let expected = self.confirmation_phrase();
        match confirm {
            Some(given) if given == expected => Ok(()),
            Some(_) => Err(format!(
                "confirm_destructive does not match; expected \"{}\"",
                expected
            )),
            None => Err(format!(
                "REPLACE restores require confirm_destructive = \"{}\"",
                expected
            )),
        }
    }

    pub fn into_new_job(
        self,
        triggered_by: &str,
        policy: ConcurrencyPolicy,
    ) -> Result<NewJob, serde_json::Error> {
        let steps = match self.mode {
            RestoreMode::New => NEW_STEPS.to_vec(),
            RestoreMode::Replace => REPLACE_STEPS.to_vec(),
        };
        Ok(NewJob {
            kind: JobKind::Restore,
            initial_status: JobStatus::Planned,
            exclusivity_key: policy.exclusivity_key(JobKind::Restore, Some(self.vm_id.as_str())),
            subject: Some(self.vm_id.clone()),
            payload: serde_json::to_value(&self)?,
            triggered_by: triggered_by.to_string(),
            steps,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Validate a restore request against inventory and build its plan.
///
/// Only reads from the platform.
pub async fn plan(
    inventory: &dyn Inventory,
    request: &PlanRequest,
    settings: &RestoreSettings,
) -> Result<RestorePlan, PlanError> {
    let invalid = |msg: String| Err(PlanError::Invalid(msg));

    if inventory.project(&request.project_id).await?.is_none() {
        return invalid(format!("unknown project {}", request.project_id));
    }
    let Some(server) = inventory.server(&request.vm_id).await? else {
        return invalid(format!("unknown VM {}", request.vm_id));
    };
    let Some(point) = inventory.restore_point(&request.restore_point_id).await? else {
        return invalid(format!("unknown restore point {}", request.restore_point_id));
    };

    if server.project_id != request.project_id {
        return invalid(format!(
            "VM {} belongs to project {}, not {}",
            server.id, server.project_id, request.project_id
        ));
    }
    let Some(boot_volume_id) = server.boot_volume_id.clone() else {
        return invalid(format!("VM {} has no boot volume", server.id));
    };
    if point.volume_id != boot_volume_id {
        return invalid(format!(
            "restore point {} is not a snapshot of VM {}'s boot volume",
            point.id, server.id
        ));
    }
    if !point.is_available() {
        return invalid(format!(
            "restore point {} is {}, not available",
            point.id, point.status
        ));
    }

    let explicit_name = request
        .new_vm_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    let new_vm_name = match (request.mode, explicit_name) {
        (_, Some(name)) => name.to_string(),
        (RestoreMode::Replace, None) => server.name.clone(),
        (RestoreMode::New, None) => match &settings.name_suffix {
            Some(suffix) => format!("{}{}", server.name, suffix),
            None => return invalid("new_vm_name is required for NEW restores".to_string()),
        },
    };

    Ok(RestorePlan {
        project_id: request.project_id.clone(),
        vm_id: server.id,
        restore_point_id: point.id,
        mode: request.mode,
        ip_strategy: request.ip_strategy,
        original_vm_name: server.name,
        new_vm_name,
        flavor_id: server.flavor_id,
        boot_volume_id,
        original_addresses: server.addresses,
        cleanup: settings.cleanup,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedPort {
    pub port_id: String,
    pub network_id: String,
    pub ip_address: String,
    /// Whether the original address was kept
    pub reused: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct VolumeResult {
    volume_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PortsResult {
    ports: Vec<PreparedPort>,
}

fn load_plan(job: &Job) -> Result<RestorePlan, StepFailure> {
    RestorePlan::from_job(job).map_err(|e| StepFailure::new("invalid_plan", e.to_string()))
}

fn previous<T: DeserializeOwned>(job: &Job, key: &str) -> Result<T, StepFailure> {
    let value = job.step_result(key).cloned().ok_or_else(|| {
        StepFailure::new("missing_result", format!("step {} has no recorded result", key))
    })?;
    serde_json::from_value(value).map_err(|e| StepFailure::new("invalid_result", e.to_string()))
}

fn to_result<T: Serialize>(value: &T) -> Result<Option<serde_json::Value>, StepFailure> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| StepFailure::new("invalid_result", e.to_string()))
}

#[derive(Clone, Copy)]
enum Action {
    CreateVolume,
    DeleteOriginalVm,
    PreparePorts,
    CreateVm,
    Cleanup,
}

struct RestoreStep {
    ops: Arc<dyn RestoreOps>,
    action: Action,
}

#[async_trait]
impl StepHandler for RestoreStep {
    async fn run(&self, job: &Job) -> Result<Option<serde_json::Value>, StepFailure> {
        let plan = load_plan(job)?;
        match self.action {
            Action::CreateVolume => {
                let volume = self
                    .ops
                    .create_volume(
                        &plan.project_id,
                        &plan.restore_point_id,
                        &format!("{}-boot", plan.new_vm_name),
                    )
                    .await?;
                info!(job_id = %job.id, volume_id = %volume.id, "Restored volume created");
                to_result(&VolumeResult {
                    volume_id: volume.id,
                })
            }
            Action::DeleteOriginalVm => {
                self.ops.delete_server(&plan.vm_id).await?;
                info!(job_id = %job.id, vm_id = %plan.vm_id, "Original VM deleted");
                Ok(Some(serde_json::json!({ "deleted_server_id": plan.vm_id })))
            }
            Action::PreparePorts => {
                let ports = prepare_ports(self.ops.as_ref(), &plan).await?;
                to_result(&PortsResult { ports })
            }
            Action::CreateVm => {
                let volume: VolumeResult = previous(job, CREATE_VOLUME)?;
                let ports: PortsResult = previous(job, PREPARE_PORTS)?;
                let spec = ServerSpec {
                    name: plan.new_vm_name.clone(),
                    project_id: plan.project_id.clone(),
                    flavor_id: plan.flavor_id.clone(),
                    boot_volume_id: volume.volume_id,
                    port_ids: ports.ports.into_iter().map(|p| p.port_id).collect(),
                };
                let server = self.ops.create_server(&spec).await?;
                info!(job_id = %job.id, server_id = %server.id, "Restored VM booted");
                Ok(Some(serde_json::json!({ "server_id": server.id, "name": server.name })))
            }
            Action::Cleanup => match plan.cleanup {
                CleanupPolicy::DeleteOriginalVolume => {
                    self.ops.delete_volume(&plan.boot_volume_id).await?;
                    Ok(Some(serde_json::json!({ "deleted_volume_id": plan.boot_volume_id })))
                }
                CleanupPolicy::Keep => {
                    Ok(Some(serde_json::json!({ "kept_volume_id": plan.boot_volume_id })))
                }
            },
        }
    }
}

/// Create one port per original address according to the plan's IP strategy.
async fn prepare_ports(
    ops: &dyn RestoreOps,
    plan: &RestorePlan,
) -> Result<Vec<PreparedPort>, StepFailure> {
    let mut prepared = Vec::with_capacity(plan.original_addresses.len());

    for address in &plan.original_addresses {
        let (port, reused) = match plan.ip_strategy {
            IpStrategy::NewIps => (
                ops.create_port(&plan.project_id, &address.network_id, None)
                    .await?,
                false,
            ),
            IpStrategy::TrySameIps => {
                match ops
                    .create_port(&plan.project_id, &address.network_id, Some(&address.ip_address))
                    .await
                {
                    Ok(port) => (port, true),
                    Err(PlatformError::Conflict(reason)) => {
                        warn!(
                            ip = %address.ip_address,
                            network_id = %address.network_id,
                            "Original address unavailable ({}), falling back to a new one",
                            reason
                        );
                        (
                            ops.create_port(&plan.project_id, &address.network_id, None)
                                .await?,
                            false,
                        )
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            IpStrategy::SameIpsOrFail => {
                match ops
                    .create_port(&plan.project_id, &address.network_id, Some(&address.ip_address))
                    .await
                {
                    Ok(port) => (port, true),
                    Err(PlatformError::Conflict(reason)) => {
                        return Err(StepFailure::new(
                            "ip_unavailable",
                            format!(
                                "original address {} on network {} is unavailable: {}",
                                address.ip_address, address.network_id, reason
                            ),
                        ))
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        prepared.push(PreparedPort {
            port_id: port.id,
            network_id: port.network_id,
            ip_address: port.ip_address,
            reused,
        });
    }

    Ok(prepared)
}

pub fn handlers(ops: Arc<dyn RestoreOps>) -> StepHandlers {
    let step = |action| -> Arc<dyn StepHandler> {
        Arc::new(RestoreStep {
            ops: ops.clone(),
            action,
        })
    };
    HashMap::from([
        (CREATE_VOLUME, step(Action::CreateVolume)),
        (DELETE_ORIGINAL_VM, step(Action::DeleteOriginalVm)),
        (PREPARE_PORTS, step(Action::PreparePorts)),
        (CREATE_VM, step(Action::CreateVm)),
        (CLEANUP, step(Action::Cleanup)),
    ])
}
