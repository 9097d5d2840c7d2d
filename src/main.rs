use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use clap::{Parser, Subcommand};
use sqlx::{Pool, Postgres};
use tokio::sync::Semaphore;
use tracing::{error, info};
use tracing_subscriber::{Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod db;
mod jobs;
mod platform;
mod shutdown;
mod worker;

use crate::api::{
    RestoreService, SnapshotService, health::health_config, restore::handlers::restore_config,
    snapshot::handlers::snapshot_config, validation,
};
use crate::config::Config;
use crate::db::PgJobStore;
use crate::jobs::{JobKind, JobStore, StepEngine, restore, snapshot};
use crate::platform::PlatformClient;
use crate::shutdown::ShutdownCoordinator;
use crate::worker::{JobWorker, reconcile_stale_jobs};

#[derive(Parser)]
#[command(name = "vmjobs", about = "VM snapshot pipeline and restore job service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and the job worker (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
    /// Fail jobs left running by a dead worker and exit
    Recover,
}

fn init_logging(log_dir: &str) -> io::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    // Daily rotation, one file per level: logs/info.log.2025-06-01, logs/error.log.2025-06-01, ...
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    let info_layer = tracing_subscriber::fmt::layer()
        .with_writer(tracing_appender::rolling::daily(log_dir, "info.log"))
        .with_ansi(false)
        .with_filter(LevelFilter::INFO);

    let warn_layer = tracing_subscriber::fmt::layer()
        .with_writer(tracing_appender::rolling::daily(log_dir, "warn.log"))
        .with_ansi(false)
        .with_filter(LevelFilter::WARN);

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(tracing_appender::rolling::daily(log_dir, "error.log"))
        .with_ansi(false)
        .with_filter(LevelFilter::ERROR);

    let debug_layer = tracing_subscriber::fmt::layer()
        .with_writer(tracing_appender::rolling::daily(log_dir, "debug.log"))
        .with_ansi(false)
        .with_filter(LevelFilter::DEBUG);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(info_layer)
        .with(warn_layer)
        .with(error_layer)
        .with(debug_layer)
        .init();
    Ok(())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().map_err(io::Error::other)?;
    init_logging(&config.log_dir)?;

    let pool = db::connection::get_connection(&config.database_url, config.max_db_connections)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            io::Error::other(e)
        })?;
    info!("Database connection pool established");

    db::migrations::run_migrations(&pool).await.map_err(|e| {
        error!("Failed to run database migrations: {}", e);
        io::Error::other(e)
    })?;

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => Ok(()),
        Command::Recover => {
            let grace = config.worker.recovery_grace;
            let count = reconcile_stale_jobs(store.as_ref(), grace, &HashSet::new())
                .await
                .map_err(io::Error::other)?;
            info!("Recovery finished, {} jobs marked interrupted", count);
            Ok(())
        }
        Command::Serve => serve(config, pool, store).await,
    }
}

async fn serve(config: Config, pool: Pool<Postgres>, store: Arc<dyn JobStore>) -> io::Result<()> {
    info!("Starting vmjobs");
    info!("Configuration loaded successfully:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Max payload size: {} bytes", config.max_payload_size);
    info!("  - Max database connections: {}", config.max_db_connections);
    info!("  - Max concurrent jobs: {}", config.worker.max_concurrent_jobs);
    info!("  - Step timeout: {}s", config.worker.step_timeout.as_secs());
    info!("  - Platform API: {}", config.platform_api_url);

    // Jobs a previous process left running can never finish. The worker repeats this
    // every grace period for claims too recent to judge now.
    let grace = config.worker.recovery_grace;
    reconcile_stale_jobs(store.as_ref(), grace, &HashSet::new())
        .await
        .map_err(io::Error::other)?;

    let platform = Arc::new(
        PlatformClient::new(&config.platform_api_url, config.platform_request_timeout)
            .map_err(io::Error::other)?,
    );

    let handlers = HashMap::from([
        (JobKind::SnapshotPipeline, snapshot::handlers(platform.clone())),
        (JobKind::Restore, restore::handlers(platform.clone())),
    ]);
    let engine = StepEngine::new(store.clone(), config.worker.step_timeout);
    let job_worker = JobWorker::new(
        store.clone(),
        engine,
        handlers,
        config.worker.poll_interval,
        config.worker.recovery_grace,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let semaphore = Arc::new(Semaphore::new(config.worker.max_concurrent_jobs));
    let worker_handle = tokio::spawn(async move {
        job_worker.run(semaphore, shutdown_rx).await;
    });

    let snapshot_service = web::Data::new(SnapshotService::new(store.clone()));
    let restore_service = web::Data::new(RestoreService::new(
        store.clone(),
        platform,
        config.restore.clone(),
    ));
    let store_data: web::Data<dyn JobStore> = web::Data::from(store);
    let max_payload_size = config.max_payload_size;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(store_data.clone())
            .app_data(snapshot_service.clone())
            .app_data(restore_service.clone())
            .app_data(web::PayloadConfig::default().limit(max_payload_size))
            .app_data(validation::json_config())
            .configure(health_config)
            .configure(snapshot_config)
            .configure(restore_config)
    });

    info!("Server starting on http://{}", config.bind_addr);
    let server = server.bind(config.bind_addr.as_str())?.run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    ShutdownCoordinator::new(server_handle, server_task, worker_handle, shutdown_tx, pool)
        .wait_for_shutdown()
        .await
}
