//! Sequential step execution with per-step failure isolation.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::store::{JobStore, StoreError};
use super::types::{Job, JobStatus, StepUpdate};

/// Structured failure reported by a step handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StepFailure {
    pub kind: String,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// One unit of work within a job.
///
/// Handlers receive the job as persisted so far, including results of the
/// steps that already completed. A returned value is stored on the step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, job: &Job) -> Result<Option<serde_json::Value>, StepFailure>;
}

/// Handlers for one job kind, keyed by step key.
pub type StepHandlers = HashMap<&'static str, Arc<dyn StepHandler>>;

/// Drives a claimed job through its steps, persisting every transition.
#[derive(Clone)]
pub struct StepEngine {
    store: Arc<dyn JobStore>,
    step_timeout: Duration,
}

impl StepEngine {
    pub fn new(store: Arc<dyn JobStore>, step_timeout: Duration) -> Self {
        Self {
            store,
            step_timeout,
        }
    }

    /// Run every step of `job` in order and write the terminal status.
    ///
    /// Handler failures never escape: they are recorded on the step and the
    /// job finishes `failed`. Only store errors are returned.
    #[instrument(skip_all, fields(job_id = %job.id, kind = %job.kind))]
    pub async fn run(&self, mut job: Job, handlers: &StepHandlers) -> Result<JobStatus, StoreError> {
        info!("Starting job with {} steps", job.steps.len());

        for index in 0..job.steps.len() {
            let key = job.steps[index].key.clone();

            if self.store.is_cancel_requested(job.id).await? {
                info!(step = %key, "Cancellation observed, stopping before step");
                self.store.finish(job.id, JobStatus::Cancelled, None).await?;
                return Ok(JobStatus::Cancelled);
            }

            let running = StepUpdate::running();
            self.store.update_step(job.id, &key, running.clone()).await?;
            running.apply(&mut job.steps[index], chrono::Utc::now());
            debug!(step = %key, "Step running");

            let outcome = match handlers.get(key.as_str()) {
                Some(handler) => self.invoke(handler.as_ref(), &job).await,
                None => Err(StepFailure::new(
                    "missing_handler",
                    format!("no handler registered for step {}", key),
                )),
            };

            match outcome {
                Ok(result) => {
                    let update = StepUpdate::completed(result);
                    self.store.update_step(job.id, &key, update.clone()).await?;
                    update.apply(&mut job.steps[index], chrono::Utc::now());
                    info!(step = %key, "Step completed");
                }
                Err(failure) => {
                    let message = failure.to_string();
                    warn!(step = %key, error = %message, "Step failed");
                    self.store
                        .update_step(job.id, &key, StepUpdate::failed(message.clone()))
                        .await?;
                    self.store
                        .finish(
                            job.id,
                            JobStatus::Failed,
                            Some(format!("step {} failed: {}", key, message)),
                        )
                        .await?;
                    return Ok(JobStatus::Failed);
                }
            }
        }

        // A cancel accepted while the last step ran still wins
        if self.store.is_cancel_requested(job.id).await? {
            info!("Cancellation observed after the last step");
            self.store.finish(job.id, JobStatus::Cancelled, None).await?;
            return Ok(JobStatus::Cancelled);
        }

        self.store.finish(job.id, JobStatus::Completed, None).await?;
        info!("Job completed");
        Ok(JobStatus::Completed)
    }

    async fn invoke(
        &self,
        handler: &dyn StepHandler,
        job: &Job,
    ) -> Result<Option<serde_json::Value>, StepFailure> {
        let guarded = AssertUnwindSafe(handler.run(job)).catch_unwind();
        match tokio::time::timeout(self.step_timeout, guarded).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                error!(job_id = %job.id, "Step handler panicked");
                Err(StepFailure::new("panic", "step handler panicked"))
            }
            Err(_) => Err(StepFailure::new(
                "timeout",
                format!("step exceeded {}s", self.step_timeout.as_secs()),
            )),
        }
    }
}
