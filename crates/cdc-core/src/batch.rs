//! Batches: the atomicity boundary of the applier.

use std::collections::{BTreeMap, HashSet};

use crate::position::{PartitionId, SourcePosition};
use crate::record::{ChangeRecord, RecordKey};

/// Per-partition bookkeeping carried by a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSlice {
    /// Highest position delivered for this partition, including events that
    /// never became records (tombstones, dead-lettered payloads).
    pub max_position: Option<SourcePosition>,
    /// Committed position the worker believes the ledger holds.
    ///
    /// The applier treats a ledger value below this as a regression.
    pub expected_committed: Option<SourcePosition>,
}

/// Ordered list of change records plus per-partition high-water marks.
///
/// Either every record is applied and every partition's ledger entry advances
/// to its `max_position`, or nothing changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    records: Vec<ChangeRecord>,
    partitions: BTreeMap<PartitionId, PartitionSlice>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a batch for a single partition worker.
    pub fn for_partition(partition: PartitionId, expected_committed: Option<SourcePosition>) -> Self {
        let mut partitions = BTreeMap::new();
        partitions.insert(
            partition,
            PartitionSlice {
                max_position: None,
                expected_committed,
            },
        );
        Self {
            records: Vec::new(),
            partitions,
        }
    }

    pub fn push(&mut self, record: ChangeRecord) {
        self.observe_position(&record.partition, record.position);
        self.records.push(record);
    }

    /// Record that an event at `position` was consumed without producing a
    /// record, so the ledger still advances past it.
    pub fn observe_position(&mut self, partition: &PartitionId, position: SourcePosition) {
        let slice = self.partitions.entry(partition.clone()).or_default();
        slice.max_position = Some(match slice.max_position {
            Some(current) => current.max(position),
            None => position,
        });
    }

    pub fn set_expected_committed(
        &mut self,
        partition: &PartitionId,
        expected: Option<SourcePosition>,
    ) {
        self.partitions
            .entry(partition.clone())
            .or_default()
            .expected_committed = expected;
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn record(&self, index: usize) -> Option<&ChangeRecord> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the batch holds neither records nor consumed positions.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.partitions.values().all(|s| s.max_position.is_none())
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&PartitionId, &PartitionSlice)> {
        self.partitions.iter()
    }

    pub fn slice(&self, partition: &PartitionId) -> Option<&PartitionSlice> {
        self.partitions.get(partition)
    }

    pub fn max_position(&self, partition: &PartitionId) -> Option<SourcePosition> {
        self.partitions.get(partition).and_then(|s| s.max_position)
    }

    /// Index of the record delivered at `position` on `partition`.
    pub fn find(&self, partition: &PartitionId, position: SourcePosition) -> Option<usize> {
        self.records
            .iter()
            .position(|r| &r.partition == partition && r.position == position)
    }

    /// Extract a record, keeping its position in the partition's high-water mark.
    pub fn remove(&mut self, index: usize) -> Option<ChangeRecord> {
        if index < self.records.len() {
            Some(self.records.remove(index))
        } else {
            None
        }
    }
}

/// Which records of a batch must actually be written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyPlan {
    /// Indices into `Batch::records`, in batch order
    pub indices: Vec<usize>,
    /// Records at or below their partition's committed position
    pub skipped_stale: usize,
    /// Records superseded by a later record for the same key in this batch
    pub collapsed: usize,
}

/// Decide which records to materialize given the ledger's committed positions.
///
/// Records at or below the committed position are redeliveries and are skipped.
/// When several records of one partition target the same table and key, only the
/// last one (highest position) is kept; intermediate states are transient.
pub fn plan_apply(batch: &Batch, committed: &BTreeMap<PartitionId, SourcePosition>) -> ApplyPlan {
    let mut plan = ApplyPlan::default();
    let mut seen: HashSet<(&PartitionId, &str, &RecordKey)> = HashSet::new();

    for (index, record) in batch.records.iter().enumerate().rev() {
        if let Some(floor) = committed.get(&record.partition) {
            if record.position <= *floor {
                plan.skipped_stale += 1;
                continue;
            }
        }
        if !seen.insert((&record.partition, record.source_table.as_str(), &record.key)) {
            plan.collapsed += 1;
            continue;
        }
        plan.indices.push(index);
    }

    plan.indices.reverse();
    plan
}
