use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    Inventory, PlatformError, Port, Project, RestoreOps, RestorePoint, Server, ServerSpec,
    SnapshotOps, Volume,
};

/// HTTP client for the platform gateway.
///
/// Every request is bounded by the configured timeout so a stuck platform
/// call surfaces as a step failure instead of stalling the worker.
#[derive(Clone)]
pub struct PlatformClient {
    http: Client,
    base_url: String,
}

impl PlatformClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PlatformError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, PlatformError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!("POST {}", path);
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, PlatformError> {
        debug!("GET {}", path);
        let response = self.http.get(self.url(path)).send().await?;
        match check(response).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(PlatformError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), PlatformError> {
        debug!("DELETE {}", path);
        let response = self.http.delete(self.url(path)).send().await?;
        match check(response).await {
            Ok(_) => Ok(()),
            Err(PlatformError::NotFound(_)) => {
                warn!("{} already absent", path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn check(response: Response) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => PlatformError::NotFound(body),
        StatusCode::CONFLICT => PlatformError::Conflict(body),
        _ => PlatformError::Status {
            status: status.as_u16(),
            body,
        },
    })
}

#[async_trait]
impl SnapshotOps for PlatformClient {
    async fn assign_policies(&self) -> Result<serde_json::Value, PlatformError> {
        self.post("/policies/assign", &json!({})).await
    }

    async fn sync_inventory(&self) -> Result<serde_json::Value, PlatformError> {
        self.post("/inventory/sync", &json!({})).await
    }

    async fn run_auto_snapshots(&self) -> Result<serde_json::Value, PlatformError> {
        self.post("/snapshots/auto", &json!({})).await
    }
}

#[async_trait]
impl Inventory for PlatformClient {
    async fn project(&self, id: &str) -> Result<Option<Project>, PlatformError> {
        self.get_optional(&format!("/projects/{}", id)).await
    }

    async fn server(&self, id: &str) -> Result<Option<Server>, PlatformError> {
        self.get_optional(&format!("/servers/{}", id)).await
    }

    async fn restore_point(&self, id: &str) -> Result<Option<RestorePoint>, PlatformError> {
        self.get_optional(&format!("/restore-points/{}", id)).await
    }
}

#[async_trait]
impl RestoreOps for PlatformClient {
    async fn create_volume(
        &self,
        project_id: &str,
        restore_point_id: &str,
        name: &str,
    ) -> Result<Volume, PlatformError> {
        self.post(
            "/volumes",
            &json!({
                "project_id": project_id,
                "restore_point_id": restore_point_id,
                "name": name,
            }),
        )
        .await
    }

    async fn delete_server(&self, server_id: &str) -> Result<(), PlatformError> {
        self.delete(&format!("/servers/{}", server_id)).await
    }

    async fn create_port(
        &self,
        project_id: &str,
        network_id: &str,
        fixed_ip: Option<&str>,
    ) -> Result<Port, PlatformError> {
        self.post(
            "/ports",
            &json!({
                "project_id": project_id,
                "network_id": network_id,
                "fixed_ip": fixed_ip,
            }),
        )
        .await
    }

    async fn create_server(&self, spec: &ServerSpec) -> Result<Server, PlatformError> {
        self.post("/servers", spec).await
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), PlatformError> {
        self.delete(&format!("/volumes/{}", volume_id)).await
    }
}
