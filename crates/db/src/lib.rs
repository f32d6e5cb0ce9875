//! Job Registry: the durable coordination point between the Dispatcher and
//! the Completion Handler.
//!
//! [`JobRegistry`] is implemented by [`PgJobRegistry`] (Postgres, survives
//! restarts) and [`InMemoryJobRegistry`] (single process, tests and local
//! runs).

pub mod memory;
pub mod models;
pub mod registry;
pub mod repositories;

use sqlx::postgres::PgPoolOptions;

pub use memory::InMemoryJobRegistry;
pub use registry::{CasOutcome, JobRegistry, RegistryError, TryCreateOutcome};
pub use repositories::PgJobRegistry;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Apply pending migrations from `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}

/// Round-trip a trivial query to verify connectivity.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
