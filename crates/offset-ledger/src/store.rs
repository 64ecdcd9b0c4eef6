//! Offset ledger read trait.

use async_trait::async_trait;
use cdc_core::PartitionId;

use crate::{OffsetRecord, Result};

/// Read access to the committed positions of every partition.
///
/// Implemented by each target store, since the ledger is colocated with the
/// migrated data:
/// - `MemoryTarget` (target-sink crate)
/// - `PostgresTarget` (postgres-sink crate)
#[async_trait]
pub trait OffsetLedger: Send + Sync {
    /// Read the ledger row for one partition.
    ///
    /// Returns None if nothing has been applied for the partition yet.
    async fn read_offset(&self, partition: &PartitionId) -> Result<Option<OffsetRecord>>;

    /// Read every ledger row, ordered by partition.
    async fn read_all_offsets(&self) -> Result<Vec<OffsetRecord>>;
}
