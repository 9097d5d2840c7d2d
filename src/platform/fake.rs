//! Scriptable in-memory platform for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use super::{
    Inventory, NetworkAddress, PlatformError, Port, Project, RestoreOps, RestorePoint, Server,
    ServerSpec, SnapshotOps, Volume,
};

#[derive(Default)]
pub struct FakePlatform {
    pub projects: HashMap<String, Project>,
    pub servers: HashMap<String, Server>,
    pub restore_points: HashMap<String, RestorePoint>,
    /// Addresses that refuse to be reused
    pub taken_ips: HashSet<String>,
    /// Operation names that fail with a platform error
    pub failing: HashSet<&'static str>,
    pub calls: Mutex<Vec<String>>,
}

impl FakePlatform {
    /// Project `proj-1` with VM `vm-1` (boot volume `vol-1`, one address) and
    /// an available restore point `rp-1` of that volume.
    pub fn seeded() -> Self {
        let mut fake = Self::default();
        fake.projects.insert(
            "proj-1".into(),
            Project {
                id: "proj-1".into(),
                name: "ops".into(),
            },
        );
        fake.servers.insert(
            "vm-1".into(),
            Server {
                id: "vm-1".into(),
                name: "web01".into(),
                project_id: "proj-1".into(),
                flavor_id: "m1.small".into(),
                boot_volume_id: Some("vol-1".into()),
                addresses: vec![NetworkAddress {
                    network_id: "net-1".into(),
                    ip_address: "10.0.0.5".into(),
                }],
            },
        );
        fake.restore_points.insert(
            "rp-1".into(),
            RestorePoint {
                id: "rp-1".into(),
                volume_id: "vol-1".into(),
                status: "available".into(),
            },
        );
        fake
    }

    pub fn failing(mut self, op: &'static str) -> Self {
        self.failing.insert(op);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str, detail: String) -> Result<(), PlatformError> {
        self.calls.lock().unwrap().push(format!("{}:{}", op, detail));
        if self.failing.contains(op) {
            return Err(PlatformError::Status {
                status: 500,
                body: format!("{} failed", op),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotOps for FakePlatform {
    async fn assign_policies(&self) -> Result<serde_json::Value, PlatformError> {
        self.record("assign_policies", String::new())?;
        Ok(json!({"assigned": 3}))
    }

    async fn sync_inventory(&self) -> Result<serde_json::Value, PlatformError> {
        self.record("sync_inventory", String::new())?;
        Ok(json!({"synced": true}))
    }

    async fn run_auto_snapshots(&self) -> Result<serde_json::Value, PlatformError> {
        self.record("run_auto_snapshots", String::new())?;
        Ok(json!({"created": 2}))
    }
}

#[async_trait]
impl Inventory for FakePlatform {
    async fn project(&self, id: &str) -> Result<Option<Project>, PlatformError> {
        Ok(self.projects.get(id).cloned())
    }

    async fn server(&self, id: &str) -> Result<Option<Server>, PlatformError> {
        Ok(self.servers.get(id).cloned())
    }

    async fn restore_point(&self, id: &str) -> Result<Option<RestorePoint>, PlatformError> {
        Ok(self.restore_points.get(id).cloned())
    }
}

#[async_trait]
impl RestoreOps for FakePlatform {
    async fn create_volume(
        &self,
        _project_id: &str,
        restore_point_id: &str,
        _name: &str,
    ) -> Result<Volume, PlatformError> {
        self.record("create_volume", restore_point_id.to_string())?;
        Ok(Volume {
            id: format!("vol-from-{}", restore_point_id),
        })
    }

    async fn delete_server(&self, server_id: &str) -> Result<(), PlatformError> {
        self.record("delete_server", server_id.to_string())
    }

    async fn create_port(
        &self,
        _project_id: &str,
        network_id: &str,
        fixed_ip: Option<&str>,
    ) -> Result<Port, PlatformError> {
        self.record("create_port", fixed_ip.unwrap_or("auto").to_string())?;
        if let Some(ip) = fixed_ip {
            if self.taken_ips.contains(ip) {
                return Err(PlatformError::Conflict(format!("{} in use", ip)));
            }
        }
        Ok(Port {
            id: format!("port-{}", self.calls.lock().unwrap().len()),
            network_id: network_id.to_string(),
            ip_address: fixed_ip.unwrap_or("10.0.0.99").to_string(),
        })
    }

    async fn create_server(&self, spec: &ServerSpec) -> Result<Server, PlatformError> {
        self.record("create_server", spec.name.clone())?;
        Ok(Server {
            id: "vm-new".into(),
            name: spec.name.clone(),
            project_id: spec.project_id.clone(),
            flavor_id: spec.flavor_id.clone(),
            boot_volume_id: Some(spec.boot_volume_id.clone()),
            addresses: Vec::new(),
        })
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), PlatformError> {
        self.record("delete_volume", volume_id.to_string())
    }
}
