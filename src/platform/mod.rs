//! Collaborators on the virtualization platform side.
//!
//! The job subsystem never talks to the platform directly; step handlers and
//! restore planning go through these traits. `PlatformClient` implements all
//! of them against the platform gateway's JSON API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::jobs::engine::StepFailure;

pub mod client;
#[cfg(test)]
pub mod fake;

pub use client::PlatformClient;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The platform refused because a resource (typically an address) is taken
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("platform returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<PlatformError> for StepFailure {
    fn from(err: PlatformError) -> Self {
        let kind = match &err {
            PlatformError::Conflict(_) => "conflict",
            PlatformError::NotFound(_) => "not_found",
            PlatformError::Status { .. } => "platform_error",
            PlatformError::Http(e) if e.is_timeout() => "timeout",
            PlatformError::Http(_) => "platform_unreachable",
        };
        StepFailure::new(kind, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub network_id: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub flavor_id: String,
    pub boot_volume_id: Option<String>,
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
}

/// A snapshot of a boot volume that a VM can be restored from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorePoint {
    pub id: String,
    pub volume_id: String,
    pub status: String,
}

impl RestorePoint {
    pub fn is_available(&self) -> bool {
        self.status.eq_ignore_ascii_case("available")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub network_id: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub project_id: String,
    pub flavor_id: String,
    pub boot_volume_id: String,
    pub port_ids: Vec<String>,
}

/// Operations behind the snapshot pipeline steps. Each returns the
/// collaborator's summary report, stored as the step result.
#[async_trait]
pub trait SnapshotOps: Send + Sync {
    async fn assign_policies(&self) -> Result<serde_json::Value, PlatformError>;

    async fn sync_inventory(&self) -> Result<serde_json::Value, PlatformError>;

    async fn run_auto_snapshots(&self) -> Result<serde_json::Value, PlatformError>;
}

/// Read-only lookups used while planning a restore.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn project(&self, id: &str) -> Result<Option<Project>, PlatformError>;

    async fn server(&self, id: &str) -> Result<Option<Server>, PlatformError>;

    async fn restore_point(&self, id: &str) -> Result<Option<RestorePoint>, PlatformError>;
}

/// Mutations performed by restore execution.
#[async_trait]
pub trait RestoreOps: Send + Sync {
    async fn create_volume(
        &self,
        project_id: &str,
        restore_point_id: &str,
        name: &str,
    ) -> Result<Volume, PlatformError>;

    async fn delete_server(&self, server_id: &str) -> Result<(), PlatformError>;

    /// Create a port, pinned to `fixed_ip` when given.
    async fn create_port(
        &self,
        project_id: &str,
        network_id: &str,
        fixed_ip: Option<&str>,
    ) -> Result<Port, PlatformError>;

    async fn create_server(&self, spec: &ServerSpec) -> Result<Server, PlatformError>;

    async fn delete_volume(&self, volume_id: &str) -> Result<(), PlatformError>;
}
