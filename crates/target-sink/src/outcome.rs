//! Tagged result of one batch apply.

use std::collections::BTreeMap;
use std::fmt;

use cdc_core::{Batch, PartitionId, SourcePosition};
use offset_ledger::LedgerError;
use serde::Serialize;

/// Points at one record of the batch that caused a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordRef {
    /// Index into `Batch::records`
    pub index: usize,
    pub partition: PartitionId,
    pub position: SourcePosition,
}

impl RecordRef {
    pub fn from_batch(batch: &Batch, index: usize) -> Option<Self> {
        batch.record(index).map(|r| Self {
            index,
            partition: r.partition.clone(),
            position: r.position,
        })
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.position)
    }
}

/// What a successful apply did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Records written (upserted or deleted)
    pub applied: usize,
    /// Redelivered records at or below the committed position
    pub skipped_stale: usize,
    /// Records superseded by a later record for the same key
    pub collapsed: usize,
    /// Ledger position per partition after the apply
    pub committed: BTreeMap<PartitionId, SourcePosition>,
}

/// Every way a batch apply can end. Anything but `Success` means the target
/// transaction was rolled back and neither data nor ledger changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Success(ApplyReport),
    /// Retrying the same batch later may succeed.
    ///
    /// `systemic` marks failures of the target as a whole (connection loss,
    /// shutdown) as opposed to contention on particular rows.
    TransientFailure {
        record: Option<RecordRef>,
        reason: String,
        systemic: bool,
    },
    /// The named record cannot be applied as-is.
    PermanentFailure { record: RecordRef, reason: String },
    /// The ledger holds a position behind what the worker already committed.
    LedgerInconsistency {
        partition: PartitionId,
        ledger: Option<SourcePosition>,
        expected: Option<SourcePosition>,
        reason: String,
    },
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Success(_))
    }

    /// Map a ledger check failure onto an outcome.
    ///
    /// Storage errors are transient, unreachable storage is systemic;
    /// regressions and corrupt rows are inconsistencies.
    pub fn from_ledger_error(err: &LedgerError) -> Self {
        match err {
            LedgerError::Regression {
                partition,
                stored,
                attempted,
            } => ApplyOutcome::LedgerInconsistency {
                partition: partition.clone(),
                ledger: Some(*stored),
                expected: Some(*attempted),
                reason: err.to_string(),
            },
            LedgerError::Missing {
                partition,
                expected,
            } => ApplyOutcome::LedgerInconsistency {
                partition: partition.clone(),
                ledger: None,
                expected: Some(*expected),
                reason: err.to_string(),
            },
            LedgerError::Corrupt { partition, .. } => ApplyOutcome::LedgerInconsistency {
                partition: partition.clone(),
                ledger: None,
                expected: None,
                reason: err.to_string(),
            },
            LedgerError::Unavailable(_) => ApplyOutcome::TransientFailure {
                record: None,
                reason: err.to_string(),
                systemic: true,
            },
            LedgerError::Postgres(_) => ApplyOutcome::TransientFailure {
                record: None,
                reason: err.to_string(),
                systemic: false,
            },
        }
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Success(report) => write!(
                f,
                "applied {} (stale {}, collapsed {})",
                report.applied, report.skipped_stale, report.collapsed
            ),
            ApplyOutcome::TransientFailure {
                record,
                reason,
                systemic,
            } => {
                let scope = if *systemic { "systemic" } else { "transient" };
                match record {
                    Some(r) => write!(f, "{scope} failure at {r}: {reason}"),
                    None => write!(f, "{scope} failure: {reason}"),
                }
            }
            ApplyOutcome::PermanentFailure { record, reason } => {
                write!(f, "permanent failure at {record}: {reason}")
            }
            ApplyOutcome::LedgerInconsistency { reason, .. } => {
                write!(f, "ledger inconsistency: {reason}")
            }
        }
    }
}
