//! PostgreSQL target for cdc-migrate.
//!
//! Applies change batches to a PostgreSQL schema with the `_cdc_offsets`
//! ledger in the same schema, so data and ledger commit in one transaction.
//!
//! - [`PostgresTarget`] - `TargetStore` implementation
//! - [`PostgresDeadLetterSink`] - `_cdc_dead_letters` table
//! - [`PgPool`] - Bounded pool with reconnect backoff shared by both
//! - [`classify_sqlstate`] - SQLSTATE to failure-class mapping

mod classify;
mod dead_letters;
mod pool;
mod target;

pub use classify::{classify_error, classify_sqlstate, ErrorClass};
pub use dead_letters::{PostgresDeadLetterSink, DEFAULT_DEAD_LETTER_TABLE};
pub use pool::{PgPool, PoolConfig, PooledClient};
pub use target::{delete_sql, upsert_sql, PostgresTarget};

/// Create the ledger and dead-letter tables in `schema`.
pub async fn init_schema(pool: &PgPool, schema: &str) -> anyhow::Result<()> {
    PostgresTarget::new(pool.clone(), schema).init().await?;
    PostgresDeadLetterSink::new(pool.clone(), schema)
        .ensure_table()
        .await?;
    Ok(())
}
