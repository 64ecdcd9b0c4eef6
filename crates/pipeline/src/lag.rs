//! Per-partition replication lag.

use std::collections::BTreeMap;

use cdc_core::{LagSnapshot, PartitionId, SourcePosition};
use chrono::Utc;
use tokio::sync::RwLock;
use transport::Transport;

#[derive(Debug, Default, Clone)]
struct Entry {
    head: Option<SourcePosition>,
    head_observed: bool,
    committed: Option<SourcePosition>,
    snapshot: Option<LagSnapshot>,
}

impl Entry {
    fn recompute(&mut self, partition: &PartitionId) {
        if self.head_observed {
            self.snapshot = Some(LagSnapshot::compute(
                partition.clone(),
                self.head,
                self.committed,
                Utc::now(),
            ));
        }
    }
}

/// Latest lag per partition, fed by workers (committed positions) and by a
/// periodic poll of the source heads.
///
/// A partition has no snapshot until its head has been observed once.
#[derive(Debug, Default)]
pub struct LagMonitor {
    entries: RwLock<BTreeMap<PartitionId, Entry>>,
}

impl LagMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, partition: &PartitionId) {
        self.entries
            .write()
            .await
            .entry(partition.clone())
            .or_default();
    }

    pub async fn partitions(&self) -> Vec<PartitionId> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn record_committed(&self, partition: &PartitionId, committed: SourcePosition) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(partition.clone()).or_default();
        entry.committed = Some(entry.committed.map_or(committed, |c| c.max(committed)));
        entry.recompute(partition);
    }

    pub async fn observe_head(&self, partition: &PartitionId, head: Option<SourcePosition>) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(partition.clone()).or_default();
        entry.head = head;
        entry.head_observed = true;
        entry.recompute(partition);
    }

    pub async fn snapshot(&self, partition: &PartitionId) -> Option<LagSnapshot> {
        self.entries
            .read()
            .await
            .get(partition)
            .and_then(|e| e.snapshot.clone())
    }

    /// Snapshots of every partition whose head has been observed.
    pub async fn snapshots(&self) -> Vec<LagSnapshot> {
        self.entries
            .read()
            .await
            .values()
            .filter_map(|e| e.snapshot.clone())
            .collect()
    }

    /// True once every registered partition has a snapshot.
    pub async fn fully_observed(&self) -> bool {
        let entries = self.entries.read().await;
        !entries.is_empty() && entries.values().all(|e| e.snapshot.is_some())
    }

    /// Poll the head of every registered partition once.
    ///
    /// A failing poll keeps the previous observation for that partition.
    pub async fn poll_heads(&self, transport: &dyn Transport) {
        for partition in self.partitions().await {
            match transport.head_position(&partition).await {
                Ok(head) => self.observe_head(&partition, head).await,
                Err(e) => tracing::warn!("Failed to read source head of {}: {}", partition, e),
            }
        }
    }
}
