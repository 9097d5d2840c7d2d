use actix_web::{HttpResponse, Responder, get, web};
use serde::Serialize;
use tracing::error;

use crate::jobs::JobStore;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn probe(store: &dyn JobStore, ok: &str, not_ok: &str) -> HttpResponse {
    match store.ping().await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse {
            status: ok.to_string(),
            database: "connected".to_string(),
            error: None,
        }),
        Err(e) => {
            error!("Job store unavailable: {}", e);
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: not_ok.to_string(),
                database: "disconnected".to_string(),
                error: Some(e.to_string()),
            })
        }
    }
}

/// General health check including job store connectivity.
#[get("/health")]
async fn health_check(store: web::Data<dyn JobStore>) -> impl Responder {
    probe(store.get_ref(), "healthy", "unhealthy").await
}

/// Readiness probe; fails while the job store is unreachable.
#[get("/ready")]
async fn readiness_check(store: web::Data<dyn JobStore>) -> impl Responder {
    probe(store.get_ref(), "ready", "not_ready").await
}

/// Liveness probe; never touches dependencies.
#[get("/live")]
async fn liveness_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "alive".to_string(),
        database: "not_checked".to_string(),
        error: None,
    })
}

pub fn health_config(config: &mut web::ServiceConfig) {
    config
        .service(health_check)
        .service(readiness_check)
        .service(liveness_check);
}
