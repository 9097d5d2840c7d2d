use actix_web::{HttpResponse, ResponseError};
use tracing::{error, warn};

use crate::api::validation::ErrorResponse;
use crate::jobs::{JobId, StoreError};

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Another active job holds the same slot (second snapshot pipeline, same VM)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed or inconsistent input; nothing was persisted
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation not allowed in the job's current status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The platform could not be queried while validating a request
    #[error("Platform error: {0}")]
    Upstream(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::Conflict(key) => {
                ServiceError::Conflict(format!("an active job already holds {}", key))
            }
            err @ StoreError::InvalidState { .. } => ServiceError::InvalidState(err.to_string()),
            other => ServiceError::Store(other),
        }
    }
}

impl ResponseError for ServiceError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ServiceError::Conflict(msg) => {
                warn!("Conflict: {}", msg);
                HttpResponse::Conflict().json(ErrorResponse {
                    error: "Conflict".to_string(),
                    fields: serde_json::json!({"message": msg}),
                })
            }
            ServiceError::Validation(msg) => {
                warn!("Validation error: {}", msg);
                HttpResponse::BadRequest().json(ErrorResponse {
                    error: "Validation failed".to_string(),
                    fields: serde_json::json!({"message": msg}),
                })
            }
            ServiceError::InvalidState(msg) => {
                warn!("Invalid state: {}", msg);
                HttpResponse::Conflict().json(ErrorResponse {
                    error: "Invalid state".to_string(),
                    fields: serde_json::json!({"message": msg}),
                })
            }
            ServiceError::NotFound(id) => {
                warn!("Job not found: {}", id);
                HttpResponse::NotFound().json(ErrorResponse {
                    error: "Not found".to_string(),
                    fields: serde_json::json!({"message": format!("Job with id {} not found", id)}),
                })
            }
            ServiceError::Upstream(msg) => {
                error!("Platform error: {}", msg);
                HttpResponse::BadGateway().json(ErrorResponse {
                    error: "Platform unavailable".to_string(),
                    fields: serde_json::json!({"message": msg}),
                })
            }
            ServiceError::Store(e) => {
                error!("Store error: {}", e);
                HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "Failed to process request".to_string(),
                    fields: serde_json::json!({"message": "Database error occurred"}),
                })
            }
        }
    }
}
