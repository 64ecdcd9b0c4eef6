//! Cutover gate: decides when the target may take over from the source.
//!
//! The gate is driven by lag observations stamped with a monotonic instant,
//! so dwell arithmetic is exact under a paused test clock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use cdc_core::{LagSnapshot, PartitionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Replicating,
    Converging,
    ReadyForCutover,
    CutoverInProgress,
    Decommissioned,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GateState::Replicating => "replicating",
            GateState::Converging => "converging",
            GateState::ReadyForCutover => "ready_for_cutover",
            GateState::CutoverInProgress => "cutover_in_progress",
            GateState::Decommissioned => "decommissioned",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateTransition {
    pub from: GateState,
    pub to: GateState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Who bypassed the lag requirement, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorOverride {
    pub operator: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum CutoverDecision {
    Accepted,
    Rejected(String),
}

impl CutoverDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CutoverDecision::Accepted)
    }
}

#[derive(Debug)]
struct Inner {
    state: GateState,
    writes_paused: bool,
    overridden: bool,
    lags: BTreeMap<PartitionId, u64>,
    aggregate: Option<u64>,
    zero_since: Option<Instant>,
    cutover_started: Option<Instant>,
    history: Vec<GateTransition>,
}

impl Inner {
    fn transition(&mut self, to: GateState, reason: String) {
        let from = self.state;
        if from == to {
            return;
        }
        if to == GateState::Replicating {
            tracing::warn!("Cutover gate {from} -> {to}: {reason}");
        } else {
            tracing::info!("Cutover gate {from} -> {to}: {reason}");
        }
        self.state = to;
        if to == GateState::Replicating {
            self.overridden = false;
        }
        self.history.push(GateTransition {
            from,
            to,
            at: Utc::now(),
            reason,
        });
    }

    fn zero_for(&self, now: Instant) -> Option<Duration> {
        self.zero_since.map(|since| now.saturating_duration_since(since))
    }

    /// The partition furthest behind, if any is behind at all.
    fn worst_partition(&self) -> Option<(&PartitionId, u64)> {
        self.lags
            .iter()
            .filter(|(_, lag)| **lag > 0)
            .max_by_key(|(_, lag)| **lag)
            .map(|(p, lag)| (p, *lag))
    }
}

/// `Replicating → Converging → ReadyForCutover → CutoverInProgress → Decommissioned`.
pub struct CutoverGate {
    dwell: Duration,
    inner: Mutex<Inner>,
}

impl CutoverGate {
    pub fn new(dwell: Duration) -> Self {
        Self {
            dwell,
            inner: Mutex::new(Inner {
                state: GateState::Replicating,
                writes_paused: false,
                overridden: false,
                lags: BTreeMap::new(),
                aggregate: None,
                zero_since: None,
                cutover_started: None,
                history: Vec::new(),
            }),
        }
    }

    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> GateState {
        self.lock().state
    }

    pub fn history(&self) -> Vec<GateTransition> {
        self.lock().history.clone()
    }

    pub fn writes_paused(&self) -> bool {
        self.lock().writes_paused
    }

    /// The source has stopped accepting writes.
    pub fn signal_writes_paused(&self) {
        let mut inner = self.lock();
        if !inner.writes_paused {
            tracing::info!("Source writes paused");
        }
        inner.writes_paused = true;
    }

    /// The source accepts writes again; convergence starts over.
    pub fn signal_writes_resumed(&self) {
        let mut inner = self.lock();
        inner.writes_paused = false;
        tracing::info!("Source writes resumed");
        if matches!(
            inner.state,
            GateState::Converging | GateState::ReadyForCutover
        ) {
            inner.transition(GateState::Replicating, "source writes resumed".to_string());
        }
    }

    /// Feed one round of lag observations taken at `now`.
    ///
    /// The dwell toward `ReadyForCutover` counts from the later of the first
    /// zero reading and the move into `Converging`, so zero lag observed
    /// while the source still accepted writes does not count toward it.
    pub fn observe(&self, snapshots: &[LagSnapshot], now: Instant) -> GateState {
        let mut inner = self.lock();
        let lags: BTreeMap<PartitionId, u64> = snapshots
            .iter()
            .map(|s| (s.partition.clone(), s.lag_events))
            .collect();
        let aggregate: u64 = lags.values().sum();
        let increased = lags.iter().find_map(|(p, lag)| {
            inner
                .lags
                .get(p)
                .filter(|previous| lag > *previous)
                .map(|previous| (p.clone(), *previous, *lag))
        });
        let all_zero = !lags.is_empty() && aggregate == 0;
        let previous_aggregate = inner.aggregate;

        inner.zero_since = if all_zero {
            Some(inner.zero_since.unwrap_or(now))
        } else {
            None
        };
        inner.lags = lags;
        inner.aggregate = Some(aggregate);

        match inner.state {
            GateState::Replicating => {
                let non_increasing =
                    increased.is_none() && previous_aggregate.map_or(true, |p| aggregate <= p);
                let decreasing = previous_aggregate.is_some_and(|p| aggregate < p);
                if inner.writes_paused && non_increasing && (decreasing || all_zero) {
                    inner.transition(
                        GateState::Converging,
                        format!("writes paused and aggregate lag at {aggregate}"),
                    );
                    if all_zero {
                        inner.zero_since = Some(now);
                    }
                }
            }
            GateState::Converging | GateState::ReadyForCutover => {
                if let Some((partition, before, after)) = increased {
                    if inner.overridden {
                        tracing::warn!(
                            "Lag on {partition} increased from {before} to {after}; gate held at {} by operator override",
                            inner.state
                        );
                    } else {
                        inner.transition(
                            GateState::Replicating,
                            format!("partition {partition} lag increased from {before} to {after}"),
                        );
                    }
                } else if inner.state == GateState::Converging
                    && inner.zero_for(now).is_some_and(|d| d >= self.dwell)
                {
                    inner.transition(
                        GateState::ReadyForCutover,
                        format!("all partitions at lag 0 for {:?}", self.dwell),
                    );
                }
            }
            GateState::CutoverInProgress => {
                let confirmed_since = match (inner.zero_since, inner.cutover_started) {
                    (Some(zero), Some(started)) => Some(zero.max(started)),
                    _ => None,
                };
                match confirmed_since {
                    Some(since) if now.saturating_duration_since(since) >= self.dwell => {
                        inner.transition(
                            GateState::Decommissioned,
                            format!("lag stayed at 0 for {:?} after cutover", self.dwell),
                        );
                    }
                    _ => {
                        if let Some((partition, before, after)) = increased {
                            tracing::warn!(
                                "Lag on {partition} increased from {before} to {after} during cutover"
                            );
                        }
                    }
                }
            }
            GateState::Decommissioned => {}
        }
        inner.state
    }

    pub fn request_cutover(&self) -> CutoverDecision {
        self.request_cutover_at(Instant::now())
    }

    pub fn request_cutover_at(&self, now: Instant) -> CutoverDecision {
        let mut inner = self.lock();
        let decision = match inner.state {
            GateState::ReadyForCutover => {
                let reason = if inner.overridden {
                    "cutover requested (operator override)"
                } else {
                    "cutover requested"
                };
                inner.cutover_started = Some(now);
                inner.transition(GateState::CutoverInProgress, reason.to_string());
                CutoverDecision::Accepted
            }
            GateState::CutoverInProgress => {
                CutoverDecision::Rejected("cutover already in progress".to_string())
            }
            GateState::Decommissioned => {
                CutoverDecision::Rejected("source already decommissioned".to_string())
            }
            state => CutoverDecision::Rejected(self.rejection_reason(&inner, state, now)),
        };
        if let CutoverDecision::Rejected(reason) = &decision {
            tracing::info!("Cutover request rejected: {reason}");
        }
        decision
    }

    fn rejection_reason(&self, inner: &Inner, state: GateState, now: Instant) -> String {
        if inner.aggregate.is_none() {
            return "no lag observations yet".to_string();
        }
        if let Some((partition, lag)) = inner.worst_partition() {
            return format!("partition {partition} lag = {lag}, threshold = 0");
        }
        if !inner.writes_paused {
            return "source writes are not paused".to_string();
        }
        let zero_for = inner.zero_for(now).unwrap_or_default();
        format!(
            "gate is {state}; lag has been 0 for {:?} of the required {:?}",
            zero_for, self.dwell
        )
    }

    /// Move to `ReadyForCutover` regardless of lag.
    pub fn force_ready(&self, operator: OperatorOverride) -> Result<(), ControlError> {
        let mut inner = self.lock();
        match inner.state {
            GateState::Replicating | GateState::Converging | GateState::ReadyForCutover => {}
            state => return Err(ControlError::InvalidOverride(state.to_string())),
        }
        tracing::warn!(
            "Operator {} forced the cutover gate to ready: {}",
            operator.operator,
            operator.reason
        );
        let reason = format!(
            "operator override by {}: {}",
            operator.operator, operator.reason
        );
        inner.overridden = true;
        if inner.state == GateState::ReadyForCutover {
            let at = Utc::now();
            inner.history.push(GateTransition {
                from: GateState::ReadyForCutover,
                to: GateState::ReadyForCutover,
                at,
                reason,
            });
        } else {
            inner.transition(GateState::ReadyForCutover, reason);
        }
        Ok(())
    }
}
