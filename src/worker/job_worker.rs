use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::recovery::{self, reconcile_stale_jobs, STORE_FAILURE_ERROR};
use crate::jobs::{JobId, JobKind, JobStatus, JobStore, StepEngine, StepHandlers};

/// Background worker that polls the job store and drives claimed jobs
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    engine: StepEngine,
    handlers: Arc<HashMap<JobKind, StepHandlers>>,
    poll_interval: Duration,
    recovery_grace: Duration,
}

/// Jobs this process has claimed and is still running.
pub struct InFlight {
    tasks: JoinSet<JobId>,
    ids: HashSet<JobId>,
}

impl InFlight {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            ids: HashSet::new(),
        }
    }

    pub fn ids(&self) -> &HashSet<JobId> {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn spawn<F>(&mut self, job_id: JobId, run: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.ids.insert(job_id);
        // The id must come back even if the run panics, or it would never be reconciled
        self.tasks.spawn(async move {
            if AssertUnwindSafe(run).catch_unwind().await.is_err() {
                error!(job_id = %job_id, "Job task panicked");
            }
            job_id
        });
    }

    /// Collect runs that already finished without waiting.
    fn reap(&mut self) {
        while let Some(Some(finished)) = self.tasks.join_next().now_or_never() {
            self.finished(finished);
        }
    }

    /// Wait for every run to finish.
    pub async fn drain(&mut self) {
        while let Some(finished) = self.tasks.join_next().await {
            self.finished(finished);
        }
    }

    fn finished(&mut self, result: Result<JobId, JoinError>) {
        match result {
            Ok(job_id) => {
                self.ids.remove(&job_id);
            }
            Err(e) => error!("Job task aborted: {:?}", e),
        }
    }
}

impl JobWorker {
    /// Create a new JobWorker instance
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: StepEngine,
        handlers: HashMap<JobKind, StepHandlers>,
        poll_interval: Duration,
        recovery_grace: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            handlers: Arc::new(handlers),
            poll_interval,
            recovery_grace,
        }
    }

    /// Run the polling loop until shutdown is signalled
    ///
    /// # Architecture
    /// - Ticks on a fixed interval
    /// - Each tick claims at most one pending job per kind
    /// - A semaphore permit is taken before claiming, so a claimed job
    ///   always starts immediately and in-flight runs stay bounded
    /// - Each claimed job runs in its own task through the step engine
    /// - Every `recovery_grace` (at least one poll interval), `running` jobs
    ///   that no task here is driving are failed as interrupted
    ///
    /// # Shutdown
    /// - Stops claiming once `shutdown_rx` flips to `true`
    /// - Waits for in-flight jobs to reach a terminal status before returning
    pub async fn run(&self, semaphore: Arc<Semaphore>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            "Job worker started (poll interval {}s, recovery every {}s)",
            self.poll_interval.as_secs(),
            self.recovery_interval().as_secs()
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut recovery = tokio::time::interval(self.recovery_interval());
        recovery.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight = InFlight::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&semaphore, &mut in_flight).await;
                }
                _ = recovery.tick() => {
                    in_flight.reap();
                    self.reconcile(&in_flight).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Job worker received shutdown signal, no longer claiming jobs");
                        break;
                    }
                }
            }

            in_flight.reap();
        }

        if !in_flight.is_empty() {
            info!("Waiting for {} in-flight jobs to finish...", in_flight.len());
        }
        in_flight.drain().await;
        info!("Job worker stopped");
    }

    fn recovery_interval(&self) -> Duration {
        self.recovery_grace.max(self.poll_interval)
    }

    /// Fail `running` jobs that this process is not driving.
    ///
    /// Returns the number of jobs reconciled.
    pub async fn reconcile(&self, in_flight: &InFlight) -> usize {
        match reconcile_stale_jobs(self.store.as_ref(), self.recovery_grace, in_flight.ids()).await {
            Ok(count) => count,
            Err(e) => {
                error!("Failed to reconcile stale jobs: {}", e);
                0
            }
        }
    }

    /// Claim at most one job per kind and spawn its run.
    ///
    /// Returns the number of jobs claimed.
    pub async fn tick(&self, semaphore: &Arc<Semaphore>, in_flight: &mut InFlight) -> usize {
        let mut claimed = 0;

        for kind in JobKind::ALL {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                debug!("All job slots busy, skipping claims this tick");
                break;
            };

            let job = match self.store.claim_next(kind).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to claim {} job: {}", kind, e);
                    continue;
                }
            };

            info!(job_id = %job.id, kind = %kind, "Claimed job");
            claimed += 1;

            let job_id = job.id;
            let store = self.store.clone();
            let engine = self.engine.clone();
            let handlers = self.handlers.clone();
            in_flight.spawn(job_id, async move {
                let empty = StepHandlers::new();
                let kind_handlers = handlers.get(&kind).unwrap_or(&empty);
                match engine.run(job, kind_handlers).await {
                    Ok(JobStatus::Completed) => info!(job_id = %job_id, "Job completed"),
                    Ok(status) => warn!(job_id = %job_id, "Job finished as {}", status),
                    Err(e) => {
                        error!(job_id = %job_id, "Job store error while running job: {}", e);
                        abandon(store.as_ref(), job_id).await;
                    }
                }
                drop(permit);
            });
        }

        claimed
    }
}

/// Best-effort cleanup after a run stopped on a store error.
///
/// If the store is still unreachable the job stays `running` and is picked
/// up by the next reconciliation once it is no longer in flight.
async fn abandon(store: &dyn JobStore, job_id: JobId) {
    let job = match store.get(job_id).await {
        Ok(job) if job.status == JobStatus::Running => job,
        Ok(_) => return,
        Err(e) => {
            warn!(job_id = %job_id, "Could not reload job after store error: {}", e);
            return;
        }
    };
    match recovery::interrupt(store, &job, STORE_FAILURE_ERROR, STORE_FAILURE_ERROR).await {
        Ok(()) => warn!(job_id = %job_id, "Job marked failed after store error"),
        Err(e) => warn!(job_id = %job_id, "Could not mark job failed after store error: {}", e),
    }
}
