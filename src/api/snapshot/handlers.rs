use actix_web::{
    HttpResponse, get, post,
    web::{Data, Path, ServiceConfig, scope},
};
use uuid::Uuid;

use super::dto::{PipelineStatus, TriggerResponse};
use super::service::SnapshotService;
use crate::api::actor::Actor;
use crate::api::error::ServiceError;
use crate::jobs::JobId;

#[post("")]
async fn trigger_pipeline(
    service: Data<SnapshotService>,
    actor: Actor,
) -> Result<HttpResponse, ServiceError> {
    let job = service.trigger(&actor.0).await?;
    Ok(HttpResponse::Accepted().json(TriggerResponse {
        message: "Snapshot pipeline queued".to_string(),
        job_id: job.id,
        status: job.status,
    }))
}

#[get("")]
async fn pipeline_status(service: Data<SnapshotService>) -> Result<HttpResponse, ServiceError> {
    let status = service
        .latest()
        .await?
        .map(PipelineStatus::from)
        .unwrap_or_else(PipelineStatus::idle);
    Ok(HttpResponse::Ok().json(status))
}

#[get("/{job_id}")]
async fn pipeline_run(
    service: Data<SnapshotService>,
    path: Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let job = service.get(JobId(path.into_inner())).await?;
    Ok(HttpResponse::Ok().json(PipelineStatus::from(job)))
}

pub fn snapshot_config(config: &mut ServiceConfig) {
    config.service(
        scope("snapshot-pipeline")
            .service(trigger_pipeline)
            .service(pipeline_status)
            .service(pipeline_run),
    );
}
