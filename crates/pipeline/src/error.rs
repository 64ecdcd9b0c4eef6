use cdc_core::{PartitionId, SourcePosition};
use offset_ledger::LedgerError;
use thiserror::Error;
use transport::TransportError;

/// Why a partition worker stopped early.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Ledger inconsistency on {partition}: {reason}")]
    LedgerInconsistency {
        partition: PartitionId,
        ledger: Option<SourcePosition>,
        expected: Option<SourcePosition>,
        reason: String,
    },

    #[error("Retries exhausted on {partition} after {attempts} attempts: {reason}")]
    RetriesExhausted {
        partition: PartitionId,
        attempts: u32,
        reason: String,
    },

    #[error("Dead-letter sink unavailable for {partition}@{position}: {reason}")]
    DeadLetterUnavailable {
        partition: PartitionId,
        position: SourcePosition,
        reason: String,
    },

    #[error("Failed to read ledger for {partition}: {source}")]
    Ledger {
        partition: PartitionId,
        #[source]
        source: LedgerError,
    },

    #[error("Transport failure on {partition}: {source}")]
    Transport {
        partition: PartitionId,
        #[source]
        source: TransportError,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControlError {
    #[error("Unknown partition {0}")]
    UnknownPartition(PartitionId),

    #[error("Partition {partition} is {state}, not blocked")]
    NotBlocked { partition: PartitionId, state: String },

    #[error("Cannot force the gate to ready from {0}")]
    InvalidOverride(String),
}
