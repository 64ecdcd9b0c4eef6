//! In-memory target with injectable faults.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cdc_core::{plan_apply, Batch, Operation, PartitionId, RecordKey, Row, SourcePosition};
use chrono::Utc;
use offset_ledger::{Advance, LedgerTable, OffsetLedger, OffsetRecord};
use tokio::sync::Mutex;

use crate::{ApplyOutcome, ApplyReport, RecordRef, TargetStore};

/// A failure the memory target produces on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail the next `remaining` applies touching `partition` (any partition
    /// when `None`) with a transient error.
    Transient {
        partition: Option<PartitionId>,
        remaining: u32,
        systemic: bool,
    },
    /// Fail every apply touching `partition` until cleared.
    PartitionOutage { partition: PartitionId },
    /// Reject every write of this table/key as a permanent data error.
    RejectKey { table: String, key: RecordKey },
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, BTreeMap<RecordKey, Row>>,
    ledger: LedgerTable,
    ledger_writes: Vec<(PartitionId, SourcePosition)>,
}

/// Tables and ledger held in memory behind one lock, so every apply is
/// trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    state: Mutex<State>,
    faults: Mutex<Vec<Fault>>,
    apply_calls: AtomicU64,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn inject(&self, fault: Fault) {
        self.faults.lock().await.push(fault);
    }

    pub async fn clear_faults(&self) {
        self.faults.lock().await.clear();
    }

    /// Remove outages for one partition.
    pub async fn restore_partition(&self, partition: &PartitionId) {
        self.faults.lock().await.retain(
            |f| !matches!(f, Fault::PartitionOutage { partition: p } if p == partition),
        );
    }

    pub async fn row(&self, table: &str, key: &RecordKey) -> Option<Row> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    pub async fn rows(&self, table: &str) -> BTreeMap<RecordKey, Row> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    /// Every ledger value written, in commit order.
    pub async fn ledger_writes(&self) -> Vec<(PartitionId, SourcePosition)> {
        self.state.lock().await.ledger_writes.clone()
    }

    /// Drop one partition's ledger row, keeping the table contents.
    pub async fn forget_ledger(&self, partition: &PartitionId) -> Option<OffsetRecord> {
        self.state.lock().await.ledger.remove(partition)
    }

    /// Overwrite a ledger row without the monotonic guard.
    pub async fn overwrite_ledger(&self, record: OffsetRecord) {
        self.state.lock().await.ledger.overwrite(record);
    }

    pub fn apply_calls(&self) -> u64 {
        self.apply_calls.load(Ordering::SeqCst)
    }

    async fn injected_transient(&self, batch: &Batch) -> Option<ApplyOutcome> {
        let mut faults = self.faults.lock().await;
        let touches = |p: &PartitionId| batch.partitions().any(|(bp, _)| bp == p);
        for fault in faults.iter_mut() {
            match fault {
                Fault::Transient {
                    partition,
                    remaining,
                    systemic,
                } if *remaining > 0 && partition.as_ref().map_or(true, touches) => {
                    *remaining -= 1;
                    return Some(ApplyOutcome::TransientFailure {
                        record: None,
                        reason: "injected transient failure".to_string(),
                        systemic: *systemic,
                    });
                }
                Fault::PartitionOutage { partition } if touches(partition) => {
                    return Some(ApplyOutcome::TransientFailure {
                        record: None,
                        reason: format!("partition {partition} unavailable"),
                        systemic: false,
                    });
                }
                _ => {}
            }
        }
        None
    }

    async fn rejected(&self, table: &str, key: &RecordKey) -> bool {
        self.faults.lock().await.iter().any(|f| {
            matches!(f, Fault::RejectKey { table: t, key: k } if t == table && k == key)
        })
    }
}

#[async_trait]
impl OffsetLedger for MemoryTarget {
    async fn read_offset(
        &self,
        partition: &PartitionId,
    ) -> offset_ledger::Result<Option<OffsetRecord>> {
        Ok(self.state.lock().await.ledger.get(partition).cloned())
    }

    async fn read_all_offsets(&self) -> offset_ledger::Result<Vec<OffsetRecord>> {
        Ok(self.state.lock().await.ledger.records())
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn apply_batch(&self, batch: &Batch) -> ApplyOutcome {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(outcome) = self.injected_transient(batch).await {
            return outcome;
        }

        let mut state = self.state.lock().await;

        let mut committed = BTreeMap::new();
        for (partition, slice) in batch.partitions() {
            if let Err(e) = state
                .ledger
                .check_not_regressed(partition, slice.expected_committed)
            {
                return ApplyOutcome::from_ledger_error(&e);
            }
            if let Some(position) = state.ledger.committed(partition) {
                committed.insert(partition.clone(), position);
            }
        }

        let plan = plan_apply(batch, &committed);

        // Validate before mutating so a rejection leaves everything untouched.
        for &index in &plan.indices {
            let Some(record) = batch.record(index) else {
                continue;
            };
            if self.rejected(&record.source_table, &record.key).await {
                if let Some(record_ref) = RecordRef::from_batch(batch, index) {
                    return ApplyOutcome::PermanentFailure {
                        record: record_ref,
                        reason: format!(
                            "row {} of {} rejected by target",
                            record.key, record.source_table
                        ),
                    };
                }
            }
        }

        for &index in &plan.indices {
            let Some(record) = batch.record(index) else {
                continue;
            };
            let table = state.tables.entry(record.source_table.clone()).or_default();
            match (record.operation, &record.after) {
                (Operation::Delete, _) => {
                    table.remove(&record.key);
                }
                (_, Some(after)) => {
                    table.insert(record.key.clone(), after.clone());
                }
                (_, None) => {
                    tracing::debug!(
                        "Skipping {} of {} without after image",
                        record.operation,
                        record.key
                    );
                }
            }
        }

        let now = Utc::now();
        let mut report = ApplyReport {
            applied: plan.indices.len(),
            skipped_stale: plan.skipped_stale,
            collapsed: plan.collapsed,
            committed: BTreeMap::new(),
        };
        for (partition, slice) in batch.partitions() {
            if let Some(max) = slice.max_position {
                if state.ledger.advance(partition, max, now) != Advance::Unchanged {
                    state.ledger_writes.push((partition.clone(), max));
                }
            }
            if let Some(position) = state.ledger.committed(partition) {
                report.committed.insert(partition.clone(), position);
            }
        }
        ApplyOutcome::Success(report)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
