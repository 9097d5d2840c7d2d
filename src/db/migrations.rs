use sqlx::{Pool, Postgres};
use tracing::info;

/// Apply pending migrations for the `jobs` and `job_steps` tables.
///
/// Migrations are embedded at compile time from `migrations/`; sqlx records
/// applied versions, so running this on every start is safe.
pub async fn run_migrations(pool: &Pool<Postgres>) -> Result<(), sqlx::migrate::MigrateError> {
    info!("Running database migrations...");

    sqlx::migrate!("./migrations").run(pool).await?;

    info!("Database migrations completed successfully");
    Ok(())
}
