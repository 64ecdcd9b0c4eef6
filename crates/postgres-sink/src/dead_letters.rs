//! `_cdc_dead_letters` table sink.

use async_trait::async_trait;
use dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterSink, WriteOutcome};
use offset_ledger::postgres::{qualified_name, quote_ident};

use crate::pool::PgPool;

/// Default dead-letter table name.
pub const DEFAULT_DEAD_LETTER_TABLE: &str = "_cdc_dead_letters";

/// Stores dead letters in the target database, outside any batch transaction.
/// One row per `(topic, partition_id, position)`.
pub struct PostgresDeadLetterSink {
    pool: PgPool,
    table: String,
    source_index: String,
}

impl PostgresDeadLetterSink {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            table: qualified_name(schema, DEFAULT_DEAD_LETTER_TABLE),
            source_index: quote_ident(&format!("{DEFAULT_DEAD_LETTER_TABLE}_source_key")),
        }
    }

    pub async fn ensure_table(&self) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                position BIGINT NOT NULL,
                original_payload TEXT NOT NULL,
                payload_encoding TEXT NOT NULL,
                failure_reason TEXT NOT NULL,
                failure_kind TEXT NOT NULL,
                first_failed_at TIMESTAMPTZ NOT NULL,
                attempt_count INTEGER NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} (topic, partition_id, position);",
            self.table, self.source_index, self.table
        );
        client.batch_execute(sql.as_str()).await?;
        tracing::info!("Ensured dead-letter table {}", self.table);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for PostgresDeadLetterSink {
    async fn write(&self, record: &DeadLetterRecord) -> dead_letter::Result<WriteOutcome> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| DeadLetterError::Unavailable(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (topic, partition_id, position, original_payload, payload_encoding,
                             failure_reason, failure_kind, first_failed_at, attempt_count)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (topic, partition_id, position) DO NOTHING",
            self.table
        );
        let position = i64::try_from(record.position.value()).map_err(|_| {
            DeadLetterError::Encoding(format!("position {} exceeds BIGINT", record.position))
        })?;
        let attempts = i32::try_from(record.attempt_count).unwrap_or(i32::MAX);
        let inserted = client
            .execute(
                sql.as_str(),
                &[
                    &record.partition.topic,
                    &record.partition.partition,
                    &position,
                    &record.original_payload,
                    &record.payload_encoding.as_str(),
                    &record.failure_reason,
                    &record.failure_kind.as_str(),
                    &record.first_failed_at,
                    &attempts,
                ],
            )
            .await
            .map_err(|e| DeadLetterError::Unavailable(e.to_string()))?;
        if inserted == 0 {
            return Ok(WriteOutcome::Duplicate);
        }
        Ok(WriteOutcome::Stored)
    }

    fn describe(&self) -> String {
        format!("table:{}", self.table)
    }
}
