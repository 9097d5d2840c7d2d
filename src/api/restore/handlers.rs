use actix_web::{
    HttpResponse, get, post,
    web::{Bytes, Data, Path, Query, ServiceConfig, scope},
};
use actix_web_validator::Json;
use uuid::Uuid;

use super::dto::{
    CancelRestoreRequest, ExecuteRestoreRequest, ListRestoresQuery, PlanResponse,
    PlanRestoreRequest, RestoreJobResponse, RestoreListResponse,
};
use super::service::RestoreService;
use crate::api::actor::Actor;
use crate::api::error::ServiceError;
use crate::api::validation::optional_json;
use crate::jobs::JobId;

#[post("/plans")]
async fn plan_restore(
    service: Data<RestoreService>,
    actor: Actor,
    body: Json<PlanRestoreRequest>,
) -> Result<HttpResponse, ServiceError> {
    let (job, plan) = service.plan(body.into_inner().into(), &actor.0).await?;
    Ok(HttpResponse::Created().json(PlanResponse::new(job, plan)))
}

#[post("/jobs/{job_id}/execute")]
async fn execute_restore(
    service: Data<RestoreService>,
    path: Path<Uuid>,
    body: Bytes,
) -> Result<HttpResponse, ServiceError> {
    let body: ExecuteRestoreRequest = optional_json(&body)?;
    let job = service
        .execute(JobId(path.into_inner()), body.confirm_destructive.as_deref())
        .await?;
    Ok(HttpResponse::Accepted().json(RestoreJobResponse {
        message: "Restore queued for execution".to_string(),
        job,
    }))
}

#[post("/jobs/{job_id}/cancel")]
async fn cancel_restore(
    service: Data<RestoreService>,
    path: Path<Uuid>,
    body: Bytes,
) -> Result<HttpResponse, ServiceError> {
    let body: CancelRestoreRequest = optional_json(&body)?;
    let job = service
        .cancel(JobId(path.into_inner()), body.reason)
        .await?;
    Ok(HttpResponse::Ok().json(RestoreJobResponse {
        message: "Cancellation requested".to_string(),
        job,
    }))
}

#[get("/jobs")]
async fn list_restores(
    service: Data<RestoreService>,
    query: Query<ListRestoresQuery>,
) -> Result<HttpResponse, ServiceError> {
    let jobs = service.list(&query).await?;
    Ok(HttpResponse::Ok().json(RestoreListResponse {
        count: jobs.len(),
        jobs,
    }))
}

#[get("/jobs/{job_id}")]
async fn get_restore(
    service: Data<RestoreService>,
    path: Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let job = service.get(JobId(path.into_inner())).await?;
    Ok(HttpResponse::Ok().json(job))
}

pub fn restore_config(config: &mut ServiceConfig) {
    config.service(
        scope("restore")
            .service(plan_restore)
            .service(execute_restore)
            .service(cancel_restore)
            .service(list_restores)
            .service(get_restore),
    );
}
