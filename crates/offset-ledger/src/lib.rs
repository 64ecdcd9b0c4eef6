//! Offset ledger for cdc-migrate
//!
//! Durable record of the last change-event position applied per source
//! partition. The ledger lives in the target database so that advancing it
//! can share a transaction with the data writes it describes.
//!
//! # Architecture
//!
//! - [`OffsetRecord`] - One ledger row per partition
//! - [`OffsetLedger`] - Read-side trait used at startup to resume workers
//! - [`LedgerTable`] - In-memory ledger with monotonic advance, used by the
//!   in-memory target
//! - [`postgres::PostgresLedger`] - `_cdc_offsets` table helpers that run inside
//!   the caller's transaction
//!
//! Writes only happen through a target store's batch apply; there is no
//! standalone "save offset" operation.

pub mod postgres;
pub mod store;
mod table;

#[cfg(test)]
mod tests;

use cdc_core::{PartitionId, SourcePosition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::OffsetLedger;
pub use table::{check_regression, Advance, LedgerTable};

/// Highest position durably applied for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub partition: PartitionId,
    pub committed_position: SourcePosition,
    pub updated_at: DateTime<Utc>,
}

impl OffsetRecord {
    pub fn new(partition: PartitionId, committed_position: SourcePosition) -> Self {
        Self {
            partition,
            committed_position,
            updated_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for OffsetRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} committed={} updated_at={}",
            self.partition,
            self.committed_position,
            self.updated_at.to_rfc3339()
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The ledger would move backwards. Never auto-corrected.
    #[error("Ledger regression on {partition}: stored {stored}, attempted {attempted}")]
    Regression {
        partition: PartitionId,
        stored: SourcePosition,
        attempted: SourcePosition,
    },

    /// A partition the worker already committed has no ledger row.
    #[error("Ledger row for {partition} vanished (expected committed position {expected})")]
    Missing {
        partition: PartitionId,
        expected: SourcePosition,
    },

    #[error("Ledger row for {partition} is corrupt: {reason}")]
    Corrupt {
        partition: PartitionId,
        reason: String,
    },

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
