//! Core types for the cdc-migrate pipeline.
//!
//! This crate provides the foundational types shared by every stage of the
//! migration consumer:
//!
//! - [`ChangeRecord`] - Canonical unit of work decoded from a change event
//! - [`RecordKey`] - Ordered, comparable primary-key tuple
//! - [`SourcePosition`] / [`PartitionId`] - Progress markers within a partition
//! - [`RawEvent`] - Undecoded message as delivered by a transport
//! - [`Batch`] - Atomicity boundary handed to the applier
//! - [`LagSnapshot`] - Latest replication lag observation for a partition
//!
//! # Architecture
//!
//! ```text
//! cdc-core (this crate)
//!    │
//!    ├─── transport        (RawEvent streams, Kafka / in-memory)
//!    ├─── change-decoder   (RawEvent -> ChangeRecord)
//!    ├─── offset-ledger    (committed SourcePosition per PartitionId)
//!    ├─── target-sink      (applies Batch atomically)
//!    ├─── dead-letter      (quarantines failed records)
//!    └─── pipeline         (per-partition workers, lag monitor, cutover gate)
//! ```

pub mod batch;
pub mod event;
pub mod lag;
pub mod position;
pub mod record;

pub use batch::{plan_apply, ApplyPlan, Batch, PartitionSlice};
pub use event::RawEvent;
pub use lag::LagSnapshot;
pub use position::{PartitionId, PartitionParseError, SourcePosition};
pub use record::{ChangeRecord, KeyColumn, KeyValue, Operation, RecordKey, Row};
