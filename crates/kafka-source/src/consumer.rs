//! Kafka implementation of the `Transport` contract.
//!
//! Each partition gets its own `StreamConsumer` with a manual assignment, so
//! workers never share a fetch queue and a slow partition cannot starve a
//! fast one. Offsets are committed manually and synchronously.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdc_core::{PartitionId, RawEvent, SourcePosition};
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use transport::{PartitionStream, Result, Transport, TransportError};

use crate::config::KafkaConfig;

fn backend(context: &str, e: KafkaError) -> TransportError {
    TransportError::Backend(format!("{context}: {e}"))
}

/// Kafka topics as a set of partitioned change streams.
pub struct KafkaTransport {
    config: KafkaConfig,
    metadata: Arc<BaseConsumer>,
}

impl KafkaTransport {
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let metadata: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| backend("Failed to create metadata consumer", e))?;
        Ok(Self {
            config,
            metadata: Arc::new(metadata),
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    fn partition_consumer(&self) -> Result<StreamConsumer> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.group_id)
            .set("enable.auto.commit", "false")
            // Only consulted when the ledger position has aged out of retention
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", &self.config.session_timeout_ms)
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| backend("Failed to create consumer", e))
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn partitions(&self) -> Result<Vec<PartitionId>> {
        let consumer = Arc::clone(&self.metadata);
        let timeout = self.config.metadata_timeout;
        let metadata = tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, timeout))
            .await
            .map_err(|e| TransportError::Unavailable(format!("metadata task failed: {e}")))?
            .map_err(|e| TransportError::Unavailable(format!("Failed to fetch metadata: {e}")))?;

        let mut partitions = Vec::new();
        for topic in metadata.topics() {
            if !self.config.selects(topic.name()) {
                continue;
            }
            for partition in topic.partitions() {
                partitions.push(PartitionId::new(topic.name(), partition.id()));
            }
        }
        partitions.sort();
        tracing::info!(
            "Discovered {} partitions across selected topics",
            partitions.len()
        );
        Ok(partitions)
    }

    async fn open(
        &self,
        partition: &PartitionId,
        resume_from: Option<SourcePosition>,
    ) -> Result<Box<dyn PartitionStream>> {
        let consumer = self.partition_consumer()?;
        let offset = start_offset(partition, resume_from)?;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&partition.topic, partition.partition, offset)
            .map_err(|e| backend("Failed to add partition offset", e))?;
        consumer
            .assign(&tpl)
            .map_err(|e| backend("Failed to assign partition", e))?;
        tracing::info!("Assigned {} starting at {:?}", partition, offset);

        Ok(Box::new(KafkaPartitionStream {
            partition: partition.clone(),
            consumer,
        }))
    }

    async fn head_position(&self, partition: &PartitionId) -> Result<Option<SourcePosition>> {
        let consumer = Arc::clone(&self.metadata);
        let timeout = self.config.metadata_timeout;
        let (topic, id) = (partition.topic.clone(), partition.partition);
        let (low, high) =
            tokio::task::spawn_blocking(move || consumer.fetch_watermarks(&topic, id, timeout))
                .await
                .map_err(|e| TransportError::Unavailable(format!("watermark task failed: {e}")))?
                .map_err(|e| {
                    TransportError::Unavailable(format!("Failed to fetch watermarks: {e}"))
                })?;
        Ok(head_from_watermarks(low, high))
    }
}

/// One assigned topic partition.
pub struct KafkaPartitionStream {
    partition: PartitionId,
    consumer: StreamConsumer,
}

#[async_trait]
impl PartitionStream for KafkaPartitionStream {
    fn partition(&self) -> &PartitionId {
        &self.partition
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<RawEvent>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(backend("Error receiving message", e)),
            Ok(Ok(msg)) => to_raw_event(&self.partition, &msg).map(Some),
        }
    }

    async fn commit(&mut self, position: SourcePosition) -> Result<()> {
        let offset = position_to_offset(&self.partition, position)?;
        let mut tpl = TopicPartitionList::new();
        // Kafka commits the offset of the next message to read.
        tpl.add_partition_offset(
            &self.partition.topic,
            self.partition.partition,
            Offset::Offset(offset + 1),
        )
        .map_err(|e| backend("Failed to add partition offset", e))?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| TransportError::Commit {
                partition: self.partition.clone(),
                position,
                reason: e.to_string(),
            })
    }
}

/// Map a Kafka message onto the transport's event type.
pub fn to_raw_event<M: Message>(partition: &PartitionId, msg: &M) -> Result<RawEvent> {
    let offset = msg.offset();
    if offset < 0 {
        return Err(TransportError::Backend(format!(
            "message on {partition} has invalid offset {offset}"
        )));
    }
    Ok(RawEvent {
        partition: partition.clone(),
        position: SourcePosition(offset as u64),
        key: msg.key().map(<[u8]>::to_vec),
        payload: msg.payload().map(<[u8]>::to_vec),
        timestamp: msg
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    })
}

/// Head position from a `(low, high)` watermark pair.
///
/// The high watermark is the offset the next message will get.
pub fn head_from_watermarks(low: i64, high: i64) -> Option<SourcePosition> {
    if high <= low || high <= 0 {
        return None;
    }
    Some(SourcePosition((high - 1) as u64))
}

/// Where a partition stream starts.
///
/// The target's ledger decides. Without a ledger row the whole retained log
/// is read, whatever the consumer group committed before.
pub fn start_offset(partition: &PartitionId, resume_from: Option<SourcePosition>) -> Result<Offset> {
    match resume_from {
        Some(position) => Ok(Offset::Offset(position_to_offset(partition, position)?)),
        None => Ok(Offset::Beginning),
    }
}

fn position_to_offset(partition: &PartitionId, position: SourcePosition) -> Result<i64> {
    i64::try_from(position.value()).map_err(|_| {
        TransportError::Backend(format!("position {position} on {partition} exceeds i64"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::{OwnedMessage, Timestamp};

    #[test]
    fn test_head_from_watermarks() {
        assert_eq!(head_from_watermarks(0, 0), None);
        assert_eq!(head_from_watermarks(0, 1), Some(SourcePosition(0)));
        assert_eq!(head_from_watermarks(5, 42), Some(SourcePosition(41)));
        // Retention deleted everything that was written
        assert_eq!(head_from_watermarks(42, 42), None);
    }

    #[test]
    fn test_start_offset_follows_ledger() {
        let p = PartitionId::new("cdc.public.users", 0);
        assert_eq!(start_offset(&p, None).unwrap(), Offset::Beginning);
        assert_eq!(
            start_offset(&p, Some(SourcePosition(41))).unwrap(),
            Offset::Offset(41)
        );
        assert!(start_offset(&p, Some(SourcePosition(u64::MAX))).is_err());
    }

    #[test]
    fn test_to_raw_event() {
        let p = PartitionId::new("cdc.public.users", 2);
        let msg = OwnedMessage::new(
            Some(br#"{"op":"c"}"#.to_vec()),
            Some(br#"{"id":1}"#.to_vec()),
            "cdc.public.users".to_string(),
            Timestamp::CreateTime(1_700_000_000_000),
            2,
            17,
            None,
        );
        let event = to_raw_event(&p, &msg).unwrap();
        assert_eq!(event.partition, p);
        assert_eq!(event.position, SourcePosition(17));
        assert_eq!(event.key.as_deref(), Some(&br#"{"id":1}"#[..]));
        assert_eq!(event.payload.as_deref(), Some(&br#"{"op":"c"}"#[..]));
        assert_eq!(
            event.timestamp.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn test_tombstone_message_has_no_payload() {
        let p = PartitionId::new("cdc.public.users", 0);
        let msg = OwnedMessage::new(
            None,
            Some(b"k".to_vec()),
            "cdc.public.users".to_string(),
            Timestamp::NotAvailable,
            0,
            3,
            None,
        );
        let event = to_raw_event(&p, &msg).unwrap();
        assert!(event.payload.is_none());
        assert!(event.timestamp.is_none());
    }
}
