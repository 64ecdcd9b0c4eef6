//! TargetStore trait definition.

use async_trait::async_trait;
use cdc_core::{Batch, PartitionId, SourcePosition};
use offset_ledger::OffsetLedger;

use crate::ApplyOutcome;

/// A database that migrated rows are written to.
///
/// # Contract
///
/// `apply_batch` runs in a single target transaction:
///
/// 1. Read (and lock) the ledger row of every partition in the batch and
///    verify it is not behind the batch's expected committed position.
/// 2. Skip records at or below the committed position; collapse records of
///    the same table and key to the last one.
/// 3. Upsert inserts and updates by key, delete deletes by key. Deleting an
///    absent row is not an error.
/// 4. Advance each partition's ledger row to `max(stored, batch max position)`.
///
/// On any failure the transaction is rolled back and the outcome says why.
#[async_trait]
pub trait TargetStore: OffsetLedger {
    async fn apply_batch(&self, batch: &Batch) -> ApplyOutcome;

    /// Short description for logs.
    fn describe(&self) -> String;

    /// Committed position for one partition, `None` before the first apply.
    async fn committed_position(
        &self,
        partition: &PartitionId,
    ) -> offset_ledger::Result<Option<SourcePosition>> {
        Ok(self
            .read_offset(partition)
            .await?
            .map(|record| record.committed_position))
    }
}
