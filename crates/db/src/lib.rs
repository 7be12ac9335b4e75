//! Annotation storage for the feedback timeline.
//!
//! - [`AnnotationBackend`] is the persistence contract, implemented for
//!   PostgreSQL ([`PgBackend`]) and for process memory ([`InMemoryBackend`]).
//! - [`AnnotationStore`] sits in front of a backend and owns order-key
//!   assignment: one writer task per video, bounded backend timeouts, and
//!   change notification to the sync hub.

pub mod backend;
pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

pub use backend::{AnnotationBackend, PgBackend};
pub use memory::InMemoryBackend;
pub use store::{AnnotationStore, AnnotationStream};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
///
/// `acquire_timeout` bounds how long a caller waits for a connection, so an
/// unreachable database surfaces as an error instead of a hung writer.
pub async fn create_pool(
    database_url: &str,
    acquire_timeout: Duration,
) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to verify connectivity.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations from `crates/db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
