//! Partition workers, lag monitor and cutover gate.
//!
//! A [`Coordinator`] discovers the transport's partitions and runs one
//! [`PartitionWorker`] per partition. Each worker resumes from the target's
//! offset ledger, groups decoded records into batches, applies every batch
//! atomically with its ledger advance, and only then commits the transport.
//! Records that cannot be applied go to the dead-letter router instead of
//! stalling the partition.
//!
//! The [`ControlHandle`] exposes lag snapshots, the [`CutoverGate`] and the
//! worker states to operators.

pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod lag;
pub mod metrics;
pub mod pause;
pub mod retry;
pub mod state;
pub mod worker;

pub use config::{PipelineConfig, RetryPolicy};
pub use control::{ControlHandle, PartitionStatus, StatusReport};
pub use coordinator::{Coordinator, RunSummary, WorkerOutcome};
pub use error::{ControlError, WorkerError};
pub use gate::{CutoverDecision, CutoverGate, GateState, GateTransition, OperatorOverride};
pub use lag::LagMonitor;
pub use metrics::{Metrics, MetricsSnapshot};
pub use pause::PauseGate;
pub use state::WorkerState;
pub use worker::{PartitionWorker, WorkerContext, WorkerHandle, WorkerSummary};
