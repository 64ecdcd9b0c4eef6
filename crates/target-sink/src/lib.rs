//! Idempotent batch applier trait abstraction.
//!
//! This crate defines the `TargetStore` trait implemented by every target
//! database. A target owns both the migrated tables and the offset ledger, and
//! applies a whole [`cdc_core::Batch`] plus the ledger advance in one
//! transaction.
//!
//! Implementations:
//! - [`MemoryTarget`] - In-process tables with fault injection
//! - `PostgresTarget` (postgres-sink crate)

mod memory;
mod outcome;
mod traits;

pub use memory::{Fault, MemoryTarget};
pub use outcome::{ApplyOutcome, ApplyReport, RecordRef};
pub use traits::TargetStore;

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("Target unavailable: {0}")]
    Unavailable(String),

    #[error("Target rejected the write: {0}")]
    Rejected(String),

    #[error(transparent)]
    Ledger(#[from] offset_ledger::LedgerError),
}
