//! Raw events as delivered by a transport, before decoding.

use chrono::{DateTime, Utc};

use crate::position::{PartitionId, SourcePosition};

/// One undecoded message from a partition's change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub partition: PartitionId,
    pub position: SourcePosition,
    /// Message key bytes, usually a JSON object of primary-key columns
    pub key: Option<Vec<u8>>,
    /// Message value bytes. `None` is a tombstone.
    pub payload: Option<Vec<u8>>,
    /// Broker-side timestamp, if the transport provides one
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawEvent {
    pub fn new(partition: PartitionId, position: SourcePosition, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            position,
            key: None,
            payload: Some(payload.into()),
            timestamp: None,
        }
    }

    pub fn tombstone(partition: PartitionId, position: SourcePosition) -> Self {
        Self {
            partition,
            position,
            key: None,
            payload: None,
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }
}
