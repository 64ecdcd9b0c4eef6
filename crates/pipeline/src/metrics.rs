//! Per-partition counters, reported in periodic log lines and the final summary.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use cdc_core::PartitionId;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct PartitionMetrics {
    events: AtomicU64,
    applied: AtomicU64,
    skipped: AtomicU64,
    batches: AtomicU64,
    retries: AtomicU64,
    dead_letters: AtomicU64,
}

impl PartitionMetrics {
    pub fn event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_committed(&self, applied: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.applied.fetch_add(applied as u64, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Events received from the transport
    pub events: u64,
    /// Records written to the target
    pub applied: u64,
    /// Events consumed without a write (tombstones, redeliveries)
    pub skipped: u64,
    /// Batches applied and committed
    pub batches: u64,
    pub retries: u64,
    pub dead_letters: u64,
}

#[derive(Debug, Default)]
pub struct Metrics {
    partitions: RwLock<BTreeMap<PartitionId, Arc<PartitionMetrics>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, partition: &PartitionId) -> Arc<PartitionMetrics> {
        if let Ok(map) = self.partitions.read() {
            if let Some(metrics) = map.get(partition) {
                return Arc::clone(metrics);
            }
        }
        match self.partitions.write() {
            Ok(mut map) => Arc::clone(map.entry(partition.clone()).or_default()),
            Err(_) => Arc::new(PartitionMetrics::default()),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<PartitionId, MetricsSnapshot> {
        self.partitions
            .read()
            .map(|map| map.iter().map(|(p, m)| (p.clone(), m.snapshot())).collect())
            .unwrap_or_default()
    }

    pub fn totals(&self) -> MetricsSnapshot {
        self.snapshot()
            .values()
            .fold(MetricsSnapshot::default(), |acc, m| MetricsSnapshot {
                events: acc.events + m.events,
                applied: acc.applied + m.applied,
                skipped: acc.skipped + m.skipped,
                batches: acc.batches + m.batches,
                retries: acc.retries + m.retries,
                dead_letters: acc.dead_letters + m.dead_letters,
            })
    }
}
