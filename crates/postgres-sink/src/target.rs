//! PostgreSQL implementation of `TargetStore`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cdc_core::{plan_apply, Batch, ChangeRecord, Operation, PartitionId};
use chrono::Utc;
use offset_ledger::postgres::{qualified_name, quote_ident, PostgresLedger, DEFAULT_OFFSETS_TABLE};
use offset_ledger::{check_regression, LedgerError, OffsetLedger, OffsetRecord};
use target_sink::{ApplyOutcome, ApplyReport, RecordRef, TargetError, TargetStore};
use tokio_postgres::Transaction;

use crate::classify::{classify_error, ErrorClass};
use crate::pool::PgPool;

/// Where a failed apply went wrong.
enum ApplyError {
    Ledger(LedgerError),
    /// A statement for one record failed
    Record {
        index: usize,
        error: tokio_postgres::Error,
    },
    /// Transaction-level failure (begin, commit, ledger I/O)
    Batch(tokio_postgres::Error),
    /// No connection could be obtained
    Unavailable(String),
}

impl From<LedgerError> for ApplyError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Postgres(pg) => ApplyError::Batch(pg),
            LedgerError::Unavailable(reason) => ApplyError::Unavailable(reason),
            other => ApplyError::Ledger(other),
        }
    }
}

impl From<tokio_postgres::Error> for ApplyError {
    fn from(e: tokio_postgres::Error) -> Self {
        ApplyError::Batch(e)
    }
}

/// Migrated tables and the offset ledger in one PostgreSQL schema.
pub struct PostgresTarget {
    pool: PgPool,
    schema: String,
    ledger: PostgresLedger,
}

impl PostgresTarget {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        let schema = schema.into();
        let ledger = PostgresLedger::new(&schema, DEFAULT_OFFSETS_TABLE);
        Self {
            pool,
            schema,
            ledger,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger table.
    pub async fn init(&self) -> Result<(), TargetError> {
        let client = self.pool.get().await?;
        self.ledger.ensure_table(&*client).await?;
        Ok(())
    }

    async fn apply_in_transaction(&self, batch: &Batch) -> Result<ApplyReport, ApplyError> {
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| ApplyError::Unavailable(e.to_string()))?;
        let tx = client.transaction().await?;

        let mut committed = BTreeMap::new();
        for (partition, slice) in batch.partitions() {
            let stored = self
                .ledger
                .read_for_update(&tx, partition)
                .await?
                .map(|r| r.committed_position);
            check_regression(partition, stored, slice.expected_committed)?;
            if let Some(position) = stored {
                committed.insert(partition.clone(), position);
            }
        }

        let plan = plan_apply(batch, &committed);
        for &index in &plan.indices {
            let Some(record) = batch.record(index) else {
                continue;
            };
            self.apply_record(&tx, record)
                .await
                .map_err(|error| ApplyError::Record { index, error })?;
        }

        let now = Utc::now();
        let mut report = ApplyReport {
            applied: plan.indices.len(),
            skipped_stale: plan.skipped_stale,
            collapsed: plan.collapsed,
            committed: committed.clone(),
        };
        for (partition, slice) in batch.partitions() {
            let Some(max) = slice.max_position else {
                continue;
            };
            self.ledger.advance(&tx, partition, max, now).await?;
            let current = committed.get(partition).map_or(max, |c| (*c).max(max));
            report.committed.insert(partition.clone(), current);
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn apply_record(
        &self,
        tx: &Transaction<'_>,
        record: &ChangeRecord,
    ) -> Result<u64, tokio_postgres::Error> {
        let table = qualified_name(&self.schema, &record.source_table);
        match (record.operation, &record.after) {
            (Operation::Delete, _) => {
                let sql = delete_sql(&table, record.key.column_names());
                tx.execute(sql.as_str(), &[&record.key.to_json_object()])
                    .await
            }
            (_, Some(after)) => {
                let sql = upsert_sql(
                    &table,
                    after.keys().map(String::as_str),
                    record.key.column_names(),
                );
                let image = serde_json::Value::Object(after.clone().into_iter().collect());
                tx.execute(sql.as_str(), &[&image]).await
            }
            (_, None) => Ok(0),
        }
    }
}

/// `INSERT ... SELECT` from `jsonb_populate_record` so JSON values are cast to
/// the column types, updating every non-key column on conflict.
pub fn upsert_sql<'a>(
    table: &str,
    columns: impl Iterator<Item = &'a str>,
    key_columns: impl Iterator<Item = &'a str>,
) -> String {
    let key_columns: Vec<&str> = key_columns.collect();
    let columns: Vec<&str> = columns.collect();
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict = key_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !key_columns.contains(*c))
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {table} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_record(NULL::{table}, $1::jsonb) \
         ON CONFLICT ({conflict}) {action}"
    )
}

/// Delete by key; deleting an absent row affects zero rows.
pub fn delete_sql<'a>(table: &str, key_columns: impl Iterator<Item = &'a str>) -> String {
    let predicate = key_columns
        .map(|c| format!("t.{0} = k.{0}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "DELETE FROM {table} AS t \
         USING jsonb_populate_record(NULL::{table}, $1::jsonb) AS k \
         WHERE {predicate}"
    )
}

#[async_trait]
impl OffsetLedger for PostgresTarget {
    async fn read_offset(
        &self,
        partition: &PartitionId,
    ) -> offset_ledger::Result<Option<OffsetRecord>> {
        let all = self.read_all_offsets().await?;
        Ok(all.into_iter().find(|r| &r.partition == partition))
    }

    async fn read_all_offsets(&self) -> offset_ledger::Result<Vec<OffsetRecord>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        self.ledger.read_all(&*client).await
    }
}

#[async_trait]
impl TargetStore for PostgresTarget {
    async fn apply_batch(&self, batch: &Batch) -> ApplyOutcome {
        match self.apply_in_transaction(batch).await {
            Ok(report) => ApplyOutcome::Success(report),
            Err(ApplyError::Ledger(e)) => ApplyOutcome::from_ledger_error(&e),
            Err(ApplyError::Record { index, error }) => {
                let record = RecordRef::from_batch(batch, index);
                let reason = describe_pg_error(&error);
                match (classify_error(&error), record) {
                    (ErrorClass::Permanent, Some(record)) => {
                        ApplyOutcome::PermanentFailure { record, reason }
                    }
                    (ErrorClass::Systemic, _) => ApplyOutcome::TransientFailure {
                        record: None,
                        reason,
                        systemic: true,
                    },
                    (_, record) => ApplyOutcome::TransientFailure {
                        record,
                        reason,
                        systemic: false,
                    },
                }
            }
            Err(ApplyError::Batch(error)) => ApplyOutcome::TransientFailure {
                record: None,
                systemic: classify_error(&error) == ErrorClass::Systemic,
                reason: describe_pg_error(&error),
            },
            Err(ApplyError::Unavailable(reason)) => ApplyOutcome::TransientFailure {
                record: None,
                reason,
                systemic: true,
            },
        }
    }

    fn describe(&self) -> String {
        format!("postgres schema {}", self.schema)
    }
}

fn describe_pg_error(error: &tokio_postgres::Error) -> String {
    match error.as_db_error() {
        Some(db) => format!("{} ({})", db.message(), db.code().code()),
        None => error.to_string(),
    }
}
