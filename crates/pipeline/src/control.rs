//! Operator-facing handle onto a running pipeline.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use cdc_core::{LagSnapshot, PartitionId};
use serde::Serialize;

use crate::error::ControlError;
use crate::gate::{CutoverDecision, CutoverGate, GateState, GateTransition, OperatorOverride};
use crate::lag::LagMonitor;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::state::WorkerState;
use crate::worker::WorkerHandle;

/// Worker handles by partition, filled in as workers start.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<BTreeMap<PartitionId, WorkerHandle>>,
}

impl WorkerRegistry {
    pub fn insert(&self, handle: WorkerHandle) {
        if let Ok(mut workers) = self.workers.write() {
            workers.insert(handle.partition.clone(), handle);
        }
    }

    pub fn get(&self, partition: &PartitionId) -> Option<WorkerHandle> {
        self.workers.read().ok()?.get(partition).cloned()
    }

    pub fn states(&self) -> BTreeMap<PartitionId, WorkerState> {
        self.workers
            .read()
            .map(|workers| {
                workers
                    .iter()
                    .map(|(p, h)| (p.clone(), h.state.borrow().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub partition: PartitionId,
    pub worker: WorkerState,
    pub lag: Option<LagSnapshot>,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub gate: GateState,
    pub writes_paused: bool,
    pub partitions: Vec<PartitionStatus>,
    pub gate_history: Vec<GateTransition>,
}

/// Cheap to clone; every method is safe to call from any task.
#[derive(Clone)]
pub struct ControlHandle {
    pub(crate) lag: Arc<LagMonitor>,
    pub(crate) gate: Arc<CutoverGate>,
    pub(crate) workers: Arc<WorkerRegistry>,
    pub(crate) metrics: Arc<Metrics>,
}

impl ControlHandle {
    pub async fn get_lag_snapshot(&self, partition: &PartitionId) -> Option<LagSnapshot> {
        self.lag.snapshot(partition).await
    }

    pub async fn lag_snapshots(&self) -> Vec<LagSnapshot> {
        self.lag.snapshots().await
    }

    pub fn request_cutover(&self) -> CutoverDecision {
        self.gate.request_cutover()
    }

    pub fn signal_writes_paused(&self) {
        self.gate.signal_writes_paused();
    }

    pub fn signal_writes_resumed(&self) {
        self.gate.signal_writes_resumed();
    }

    pub fn force_ready(&self, operator: OperatorOverride) -> Result<(), ControlError> {
        self.gate.force_ready(operator)
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    pub fn gate_history(&self) -> Vec<GateTransition> {
        self.gate.history()
    }

    pub fn worker_states(&self) -> BTreeMap<PartitionId, WorkerState> {
        self.workers.states()
    }

    /// Let a partition blocked on a schema change continue.
    pub fn resume_partition(&self, partition: &PartitionId) -> Result<(), ControlError> {
        let handle = self
            .workers
            .get(partition)
            .ok_or_else(|| ControlError::UnknownPartition(partition.clone()))?;
        let state = handle.state.borrow().clone();
        if !matches!(state, WorkerState::Blocked { .. }) {
            return Err(ControlError::NotBlocked {
                partition: partition.clone(),
                state: state.to_string(),
            });
        }
        tracing::info!("Operator resumed {}", partition);
        handle.resume.notify_one();
        Ok(())
    }

    pub async fn status(&self) -> StatusReport {
        let metrics = self.metrics.snapshot();
        let mut partitions = Vec::new();
        for (partition, worker) in self.worker_states() {
            partitions.push(PartitionStatus {
                lag: self.lag.snapshot(&partition).await,
                metrics: metrics.get(&partition).copied().unwrap_or_default(),
                partition,
                worker,
            });
        }
        StatusReport {
            gate: self.gate.state(),
            writes_paused: self.gate.writes_paused(),
            partitions,
            gate_history: self.gate.history(),
        }
    }
}
