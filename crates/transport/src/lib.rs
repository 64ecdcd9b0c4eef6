//! Transport contract for cdc-migrate.
//!
//! A transport delivers each partition's change events in position order, at
//! least once, and remembers a consumer-side committed position. The pipeline
//! commits a position only after the corresponding batch is durably applied,
//! so anything past the last commit may be redelivered after a restart.
//!
//! Implementations:
//! - [`MemoryTransport`] - In-process logs, for dry runs and tests
//! - `KafkaTransport` (kafka-source crate) - One assigned consumer per topic partition

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use cdc_core::{PartitionId, RawEvent, SourcePosition};
use thiserror::Error;

pub use memory::MemoryTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unknown partition {0}")]
    UnknownPartition(PartitionId),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Commit of {partition} at {position} failed: {reason}")]
    Commit {
        partition: PartitionId,
        position: SourcePosition,
        reason: String,
    },

    #[error("Transport error: {0}")]
    Backend(String),
}

impl TransportError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::UnknownPartition(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Source of partitioned change streams.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Every partition the pipeline should consume.
    async fn partitions(&self) -> Result<Vec<PartitionId>>;

    /// Open a stream for one partition.
    ///
    /// With `resume_from = Some(p)` the stream starts at `p` (inclusive), so the
    /// event at the committed position is redelivered and skipped by the
    /// applier. With `None` it starts from the earliest retained event.
    async fn open(
        &self,
        partition: &PartitionId,
        resume_from: Option<SourcePosition>,
    ) -> Result<Box<dyn PartitionStream>>;

    /// Position of the newest event currently available, or `None` if the
    /// partition holds no events.
    async fn head_position(&self, partition: &PartitionId) -> Result<Option<SourcePosition>>;
}

/// Ordered event stream of a single partition.
#[async_trait]
pub trait PartitionStream: Send {
    fn partition(&self) -> &PartitionId;

    /// Wait up to `timeout` for the next event. `Ok(None)` means nothing arrived.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<RawEvent>>;

    /// Record that every event up to and including `position` is processed.
    async fn commit(&mut self, position: SourcePosition) -> Result<()>;
}
