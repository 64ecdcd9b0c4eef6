//! Partition identifiers and positions within a partition's change stream.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A totally ordered marker of progress through one partition's change stream.
///
/// For the Kafka transport this is the message offset within the topic partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePosition(pub u64);

impl SourcePosition {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of events between `self` (inclusive head) and `committed`.
    pub fn distance_from(self, committed: Option<SourcePosition>) -> u64 {
        match committed {
            Some(c) => self.0.saturating_sub(c.0),
            None => self.0.saturating_add(1),
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SourcePosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifies an ordered stream of change events.
///
/// Ordering guarantees hold only within a single partition. Displayed as
/// `topic[partition]`, e.g. `cdc.public.users[3]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId {
    /// Topic (or stream) name
    pub topic: String,
    /// Partition number within the topic
    pub partition: i32,
}

impl PartitionId {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid partition id '{0}': expected 'topic[partition]' or 'topic:partition'")]
pub struct PartitionParseError(pub String);

impl FromStr for PartitionId {
    type Err = PartitionParseError;

    /// Accepts both the display form `topic[3]` and the URL-friendly `topic:3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PartitionParseError(s.to_string());
        let (topic, partition) = if let Some(stripped) = s.strip_suffix(']') {
            stripped.rsplit_once('[').ok_or_else(err)?
        } else {
            s.rsplit_once(':').ok_or_else(err)?
        };
        if topic.is_empty() {
            return Err(err());
        }
        let partition = partition.parse::<i32>().map_err(|_| err())?;
        Ok(Self::new(topic, partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_display_and_parse() {
        let p = PartitionId::new("cdc.public.users", 3);
        assert_eq!(p.to_string(), "cdc.public.users[3]");
        assert_eq!("cdc.public.users[3]".parse::<PartitionId>().unwrap(), p);
        assert_eq!("cdc.public.users:3".parse::<PartitionId>().unwrap(), p);
    }

    #[test]
    fn test_partition_parse_rejects_garbage() {
        assert!("users".parse::<PartitionId>().is_err());
        assert!("[3]".parse::<PartitionId>().is_err());
        assert!("users[x]".parse::<PartitionId>().is_err());
    }

    #[test]
    fn test_distance_from() {
        assert_eq!(SourcePosition(10).distance_from(Some(SourcePosition(4))), 6);
        assert_eq!(SourcePosition(10).distance_from(Some(SourcePosition(10))), 0);
        // Ledger ahead of a stale head reading never produces negative lag
        assert_eq!(SourcePosition(3).distance_from(Some(SourcePosition(10))), 0);
        // Nothing committed yet: every event up to and including the head is pending
        assert_eq!(SourcePosition(0).distance_from(None), 1);
    }
}
