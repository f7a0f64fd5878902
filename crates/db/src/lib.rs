//! Postgres persistence for the moderation engine.
//!
//! - [`repositories`] -- zero-sized repos over the moderation tables.
//! - [`registry`]     -- type tag to live-record handler lookup.
//! - [`interception`] -- the moderated write/read path for domain entities.
//! - [`resolver`]     -- foreign-reference checks and relation labels.

use sqlx::postgres::PgPoolOptions;

pub mod error;
pub mod interception;
pub mod models;
pub mod registry;
pub mod repositories;
pub mod resolver;

pub use error::ModerationError;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Verify the database answers a trivial query.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
