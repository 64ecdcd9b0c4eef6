//! PostgreSQL ledger table.
//!
//! The `_cdc_offsets` table shares a database (and a transaction) with the
//! migrated tables. Every function here takes a `GenericClient` so callers can
//! pass the open `Transaction` of a batch apply.

use cdc_core::{PartitionId, SourcePosition};
use chrono::{DateTime, Utc};
use tokio_postgres::GenericClient;

use crate::{LedgerError, OffsetRecord, Result};

/// Default ledger table name.
pub const DEFAULT_OFFSETS_TABLE: &str = "_cdc_offsets";

/// Quote a PostgreSQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Schema-qualified, quoted table name.
pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// SQL for the ledger table in one target schema.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    table: String,
}

impl PostgresLedger {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            table: qualified_name(schema, table),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the ledger table if it does not exist.
    pub async fn ensure_table<C: GenericClient>(&self, client: &C) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                committed_offset BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (topic, partition_id)
            )",
            self.table
        );
        client.execute(sql.as_str(), &[]).await?;
        tracing::info!("Ensured offset ledger table {}", self.table);
        Ok(())
    }

    /// Read a partition's row, locking it until the surrounding transaction ends.
    pub async fn read_for_update<C: GenericClient>(
        &self,
        client: &C,
        partition: &PartitionId,
    ) -> Result<Option<OffsetRecord>> {
        let sql = format!(
            "SELECT committed_offset, updated_at FROM {}
             WHERE topic = $1 AND partition_id = $2
             FOR UPDATE",
            self.table
        );
        let row = client
            .query_opt(sql.as_str(), &[&partition.topic, &partition.partition])
            .await?;
        row.map(|row| -> Result<OffsetRecord> {
            let offset: i64 = row.try_get(0)?;
            let updated_at: DateTime<Utc> = row.try_get(1)?;
            Ok(OffsetRecord {
                partition: partition.clone(),
                committed_position: position_from_sql(partition, offset)?,
                updated_at,
            })
        })
        .transpose()
    }

    /// Read every ledger row.
    pub async fn read_all<C: GenericClient>(&self, client: &C) -> Result<Vec<OffsetRecord>> {
        let sql = format!(
            "SELECT topic, partition_id, committed_offset, updated_at FROM {}
             ORDER BY topic, partition_id",
            self.table
        );
        let rows = client.query(sql.as_str(), &[]).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let partition = PartitionId::new(row.try_get::<_, String>(0)?, row.try_get(1)?);
            let offset: i64 = row.try_get(2)?;
            records.push(OffsetRecord {
                committed_position: position_from_sql(&partition, offset)?,
                updated_at: row.try_get(3)?,
                partition,
            });
        }
        Ok(records)
    }

    /// Upsert the committed position, refusing to move it backwards.
    ///
    /// Returns false when the stored position was already at or above `position`.
    pub async fn advance<C: GenericClient>(
        &self,
        client: &C,
        partition: &PartitionId,
        position: SourcePosition,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            "INSERT INTO {table} (topic, partition_id, committed_offset, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (topic, partition_id)
             DO UPDATE SET committed_offset = EXCLUDED.committed_offset,
                           updated_at = EXCLUDED.updated_at
             WHERE {table}.committed_offset < EXCLUDED.committed_offset",
            table = self.table
        );
        let offset = position_to_sql(partition, position)?;
        let changed = client
            .execute(
                sql.as_str(),
                &[&partition.topic, &partition.partition, &offset, &now],
            )
            .await?;
        Ok(changed > 0)
    }
}

fn position_from_sql(partition: &PartitionId, offset: i64) -> Result<SourcePosition> {
    u64::try_from(offset)
        .map(SourcePosition)
        .map_err(|_| LedgerError::Corrupt {
            partition: partition.clone(),
            reason: format!("negative committed_offset {offset}"),
        })
}

fn position_to_sql(partition: &PartitionId, position: SourcePosition) -> Result<i64> {
    i64::try_from(position.0).map_err(|_| LedgerError::Corrupt {
        partition: partition.clone(),
        reason: format!("position {position} does not fit in BIGINT"),
    })
}
