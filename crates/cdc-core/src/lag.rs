//! Replication lag observations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::position::{PartitionId, SourcePosition};

/// Latest lag observation for one partition.
///
/// Recomputed from the offset ledger and a periodically polled source head;
/// only the most recent value per partition is ever kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagSnapshot {
    pub partition: PartitionId,
    /// Most recent position available at the source, `None` for an empty partition
    pub source_head_position: Option<SourcePosition>,
    /// Highest position durably applied at the target
    pub committed_position: Option<SourcePosition>,
    /// Events available at the source but not yet applied
    pub lag_events: u64,
    pub last_observed_at: DateTime<Utc>,
}

impl LagSnapshot {
    pub fn compute(
        partition: PartitionId,
        source_head_position: Option<SourcePosition>,
        committed_position: Option<SourcePosition>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let lag_events = match source_head_position {
            Some(head) => head.distance_from(committed_position),
            None => 0,
        };
        Self {
            partition,
            source_head_position,
            committed_position,
            lag_events,
            last_observed_at: observed_at,
        }
    }

    pub fn is_caught_up(&self) -> bool {
        self.lag_events == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_lag() {
        let p = PartitionId::new("t", 0);
        let now = Utc::now();

        let empty = LagSnapshot::compute(p.clone(), None, None, now);
        assert_eq!(empty.lag_events, 0);
        assert!(empty.is_caught_up());

        let fresh = LagSnapshot::compute(p.clone(), Some(SourcePosition(9)), None, now);
        assert_eq!(fresh.lag_events, 10);

        let behind = LagSnapshot::compute(
            p.clone(),
            Some(SourcePosition(150)),
            Some(SourcePosition(10)),
            now,
        );
        assert_eq!(behind.lag_events, 140);

        let caught_up = LagSnapshot::compute(p, Some(SourcePosition(9)), Some(SourcePosition(9)), now);
        assert!(caught_up.is_caught_up());
    }
}
