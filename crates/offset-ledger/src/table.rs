//! In-memory ledger table.

use std::collections::BTreeMap;

use cdc_core::{PartitionId, SourcePosition};
use chrono::{DateTime, Utc};

use crate::{LedgerError, OffsetRecord, Result};

/// What an advance did to the ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// First successful apply for the partition
    Created,
    /// Committed position moved forward
    Advanced { from: SourcePosition },
    /// Position was not above the stored one; row left untouched
    Unchanged,
}

/// Ledger rows keyed by partition, with monotonic updates.
#[derive(Debug, Clone, Default)]
pub struct LedgerTable {
    rows: BTreeMap<PartitionId, OffsetRecord>,
}

impl LedgerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: &PartitionId) -> Option<&OffsetRecord> {
        self.rows.get(partition)
    }

    pub fn committed(&self, partition: &PartitionId) -> Option<SourcePosition> {
        self.rows.get(partition).map(|r| r.committed_position)
    }

    pub fn records(&self) -> Vec<OffsetRecord> {
        self.rows.values().cloned().collect()
    }

    /// Move the partition's committed position to `position` if it is ahead.
    ///
    /// Positions at or below the stored value leave the row unchanged, which is
    /// what a fully re-delivered batch produces.
    pub fn advance(
        &mut self,
        partition: &PartitionId,
        position: SourcePosition,
        now: DateTime<Utc>,
    ) -> Advance {
        match self.rows.get_mut(partition) {
            None => {
                self.rows.insert(
                    partition.clone(),
                    OffsetRecord {
                        partition: partition.clone(),
                        committed_position: position,
                        updated_at: now,
                    },
                );
                Advance::Created
            }
            Some(row) if position > row.committed_position => {
                let from = row.committed_position;
                row.committed_position = position;
                row.updated_at = now;
                Advance::Advanced { from }
            }
            Some(_) => Advance::Unchanged,
        }
    }

    /// Verify the stored position has not fallen behind what the caller
    /// already knows to be committed.
    pub fn check_not_regressed(
        &self,
        partition: &PartitionId,
        expected: Option<SourcePosition>,
    ) -> Result<()> {
        check_regression(partition, self.committed(partition), expected)
    }

    /// Overwrite a row without the monotonic guard.
    ///
    /// Only for simulating ledger corruption in tests and tooling.
    pub fn overwrite(&mut self, record: OffsetRecord) {
        self.rows.insert(record.partition.clone(), record);
    }

    pub fn remove(&mut self, partition: &PartitionId) -> Option<OffsetRecord> {
        self.rows.remove(partition)
    }
}

/// Compare a stored ledger position with the position a worker already knows
/// to be committed.
pub fn check_regression(
    partition: &PartitionId,
    stored: Option<SourcePosition>,
    expected: Option<SourcePosition>,
) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match stored {
        Some(stored) if stored >= expected => Ok(()),
        Some(stored) => Err(LedgerError::Regression {
            partition: partition.clone(),
            stored,
            attempted: expected,
        }),
        None => Err(LedgerError::Missing {
            partition: partition.clone(),
            expected,
        }),
    }
}
