//! Routing of failed events to the configured sink.

use std::collections::BTreeMap;
use std::sync::Arc;

use cdc_core::{PartitionId, SourcePosition};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{DeadLetterRecord, DeadLetterSink, FailureKind, Result, WriteOutcome};

/// A failed event as reported by a worker.
#[derive(Debug, Clone)]
pub struct Failure<'a> {
    pub partition: &'a PartitionId,
    pub position: SourcePosition,
    pub payload: Option<&'a [u8]>,
    pub reason: String,
    pub kind: FailureKind,
    pub attempt_count: u32,
    pub first_failed_at: DateTime<Utc>,
}

/// Shared by every partition worker.
///
/// Performs exactly one sink write per call. Retrying a failed write is the
/// caller's decision; the router only counts records that were newly stored.
pub struct DeadLetterRouter {
    sink: Arc<dyn DeadLetterSink>,
    counts: Mutex<BTreeMap<PartitionId, u64>>,
}

impl DeadLetterRouter {
    pub fn new(sink: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            sink,
            counts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn sink_description(&self) -> String {
        self.sink.describe()
    }

    /// Returns `None` when the sink already held a record for this position.
    pub async fn route(&self, failure: Failure<'_>) -> Result<Option<DeadLetterRecord>> {
        let (original_payload, payload_encoding) =
            DeadLetterRecord::encode_payload(failure.payload);
        let record = DeadLetterRecord {
            original_payload,
            payload_encoding,
            failure_reason: failure.reason,
            failure_kind: failure.kind,
            first_failed_at: failure.first_failed_at,
            attempt_count: failure.attempt_count,
            partition: failure.partition.clone(),
            position: failure.position,
        };

        if self.sink.write(&record).await? == WriteOutcome::Duplicate {
            tracing::info!(
                "{}@{} was already dead-lettered",
                record.partition,
                record.position
            );
            return Ok(None);
        }

        let total = {
            let mut counts = self.counts.lock().await;
            let count = counts.entry(record.partition.clone()).or_insert(0);
            *count += 1;
            *count
        };
        tracing::warn!(
            partition = %record.partition,
            position = %record.position,
            kind = %record.failure_kind,
            attempts = record.attempt_count,
            dead_letters = total,
            "Dead-lettered event: {}",
            record.failure_reason
        );
        Ok(Some(record))
    }

    pub async fn count(&self, partition: &PartitionId) -> u64 {
        self.counts
            .lock()
            .await
            .get(partition)
            .copied()
            .unwrap_or(0)
    }

    pub async fn counts(&self) -> BTreeMap<PartitionId, u64> {
        self.counts.lock().await.clone()
    }

    pub async fn total(&self) -> u64 {
        self.counts.lock().await.values().sum()
    }
}
