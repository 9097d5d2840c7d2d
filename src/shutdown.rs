use actix_web::dev::ServerHandle;
use sqlx::{Pool, Postgres};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Handles graceful shutdown of the application
///
/// On SIGTERM or CTRL+C:
/// 1. Stop the HTTP server (no new requests)
/// 2. Signal the job worker to stop claiming jobs
/// 3. Wait for in-flight jobs to reach a terminal status
/// 4. Close database connections
pub struct ShutdownCoordinator {
    server_handle: ServerHandle,
    server_task: JoinHandle<Result<(), std::io::Error>>,
    worker_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    pool: Pool<Postgres>,
}

impl ShutdownCoordinator {
    pub fn new(
        server_handle: ServerHandle,
        server_task: JoinHandle<Result<(), std::io::Error>>,
        worker_handle: JoinHandle<()>,
        shutdown_tx: watch::Sender<bool>,
        pool: Pool<Postgres>,
    ) -> Self {
        Self {
            server_handle,
            server_task,
            worker_handle,
            shutdown_tx,
            pool,
        }
    }

    /// Block until a shutdown signal arrives, then shut down gracefully
    pub async fn wait_for_shutdown(self) -> Result<(), std::io::Error> {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        #[cfg(unix)]
        let terminate = sigterm.recv();

        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = ctrl_c => {
                result?;
                info!("Received CTRL+C signal, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM signal, initiating graceful shutdown...");
            }
        }

        self.shutdown().await
    }

    async fn shutdown(self) -> Result<(), std::io::Error> {
        info!("Stopping HTTP server (no longer accepting new requests)...");
        self.server_handle.stop(true).await;

        info!("Signaling job worker to stop claiming jobs...");
        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal to job worker: {:?}", e);
        }

        info!("Waiting for in-flight jobs to finish...");
        match self.worker_handle.await {
            Ok(()) => info!("Job worker stopped"),
            Err(e) => error!("Job worker failed to stop: {:?}", e),
        }

        match self.server_task.await {
            Ok(Ok(())) => info!("HTTP server shut down successfully"),
            Ok(Err(e)) => error!("HTTP server encountered error during shutdown: {:?}", e),
            Err(e) => error!("HTTP server task panicked: {:?}", e),
        }

        info!("Closing database connection pool...");
        self.pool.close().await;

        info!("Graceful shutdown completed");
        Ok(())
    }
}
