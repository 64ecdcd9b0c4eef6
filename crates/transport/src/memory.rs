//! In-process transport backed by per-partition vectors.
//!
//! Position `n` is the `n`-th event published to a partition, starting at 0.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdc_core::{PartitionId, RawEvent, SourcePosition};
use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use crate::{PartitionStream, Result, Transport, TransportError};

#[derive(Debug, Default)]
struct PartitionLog {
    events: Vec<RawEvent>,
    committed: Option<SourcePosition>,
    commit_history: Vec<SourcePosition>,
}

#[derive(Debug, Default)]
struct Shared {
    logs: Mutex<BTreeMap<PartitionId, PartitionLog>>,
    appended: Notify,
}

/// Cloneable handle to a set of in-memory partition logs.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty partition. Publishing creates partitions implicitly.
    pub async fn add_partition(&self, partition: PartitionId) {
        self.shared.logs.lock().await.entry(partition).or_default();
    }

    /// Append a value with an optional message key and return its position.
    pub async fn publish(
        &self,
        partition: &PartitionId,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
    ) -> SourcePosition {
        let position = {
            let mut logs = self.shared.logs.lock().await;
            let log = logs.entry(partition.clone()).or_default();
            let position = SourcePosition(log.events.len() as u64);
            log.events.push(RawEvent {
                partition: partition.clone(),
                position,
                key,
                payload,
                timestamp: Some(Utc::now()),
            });
            position
        };
        self.shared.appended.notify_waiters();
        position
    }

    pub async fn publish_json(
        &self,
        partition: &PartitionId,
        value: &serde_json::Value,
    ) -> SourcePosition {
        self.publish(partition, None, Some(value.to_string().into_bytes()))
            .await
    }

    pub async fn publish_tombstone(&self, partition: &PartitionId) -> SourcePosition {
        self.publish(partition, None, None).await
    }

    /// Last position committed by a consumer of `partition`.
    pub async fn committed(&self, partition: &PartitionId) -> Option<SourcePosition> {
        self.shared
            .logs
            .lock()
            .await
            .get(partition)
            .and_then(|log| log.committed)
    }

    /// Every commit call in order, including ones that did not move forward.
    pub async fn commit_history(&self, partition: &PartitionId) -> Vec<SourcePosition> {
        self.shared
            .logs
            .lock()
            .await
            .get(partition)
            .map(|log| log.commit_history.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn partitions(&self) -> Result<Vec<PartitionId>> {
        Ok(self.shared.logs.lock().await.keys().cloned().collect())
    }

    async fn open(
        &self,
        partition: &PartitionId,
        resume_from: Option<SourcePosition>,
    ) -> Result<Box<dyn PartitionStream>> {
        if !self.shared.logs.lock().await.contains_key(partition) {
            return Err(TransportError::UnknownPartition(partition.clone()));
        }
        let next_index = resume_from.map_or(0, |p| p.0 as usize);
        tracing::debug!("Opened in-memory stream {} at index {}", partition, next_index);
        Ok(Box::new(MemoryStream {
            partition: partition.clone(),
            next_index,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn head_position(&self, partition: &PartitionId) -> Result<Option<SourcePosition>> {
        let logs = self.shared.logs.lock().await;
        let log = logs
            .get(partition)
            .ok_or_else(|| TransportError::UnknownPartition(partition.clone()))?;
        Ok(log.events.last().map(|e| e.position))
    }
}

struct MemoryStream {
    partition: PartitionId,
    next_index: usize,
    shared: Arc<Shared>,
}

impl MemoryStream {
    async fn try_next(&mut self) -> Option<RawEvent> {
        let logs = self.shared.logs.lock().await;
        let event = logs.get(&self.partition)?.events.get(self.next_index)?.clone();
        self.next_index += 1;
        Some(event)
    }
}

#[async_trait]
impl PartitionStream for MemoryStream {
    fn partition(&self) -> &PartitionId {
        &self.partition
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<RawEvent>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        loop {
            // Registered before the check so a publish in between is not missed.
            let appended = shared.appended.notified();
            if let Some(event) = self.try_next().await {
                return Ok(Some(event));
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, position: SourcePosition) -> Result<()> {
        let mut logs = self.shared.logs.lock().await;
        let log = logs
            .get_mut(&self.partition)
            .ok_or_else(|| TransportError::UnknownPartition(self.partition.clone()))?;
        log.commit_history.push(position);
        log.committed = Some(log.committed.map_or(position, |c| c.max(position)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p() -> PartitionId {
        PartitionId::new("cdc.public.users", 0)
    }

    #[tokio::test]
    async fn test_publish_assigns_sequential_positions() {
        let transport = MemoryTransport::new();
        assert_eq!(transport.publish_tombstone(&p()).await, SourcePosition(0));
        assert_eq!(
            transport.publish_json(&p(), &serde_json::json!({"op": "c"})).await,
            SourcePosition(1)
        );
        assert_eq!(transport.head_position(&p()).await.unwrap(), Some(SourcePosition(1)));
        assert_eq!(transport.partitions().await.unwrap(), vec![p()]);
    }

    #[tokio::test]
    async fn test_empty_partition_has_no_head() {
        let transport = MemoryTransport::new();
        transport.add_partition(p()).await;
        assert_eq!(transport.head_position(&p()).await.unwrap(), None);
        assert!(matches!(
            transport.head_position(&PartitionId::new("other", 0)).await,
            Err(TransportError::UnknownPartition(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_is_inclusive() {
        let transport = MemoryTransport::new();
        for _ in 0..5 {
            transport.publish_tombstone(&p()).await;
        }
        let mut stream = transport.open(&p(), Some(SourcePosition(3))).await.unwrap();
        let first = stream.recv(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.position, SourcePosition(3));
        let second = stream.recv(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.position, SourcePosition(4));
        assert!(stream.recv(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let transport = MemoryTransport::new();
        transport.add_partition(p()).await;
        let mut stream = transport.open(&p(), None).await.unwrap();

        let publisher = transport.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish_tombstone(&p()).await
        });

        let event = stream.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.unwrap().position, SourcePosition(0));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let transport = MemoryTransport::new();
        transport.publish_tombstone(&p()).await;
        let mut stream = transport.open(&p(), None).await.unwrap();
        stream.commit(SourcePosition(4)).await.unwrap();
        stream.commit(SourcePosition(2)).await.unwrap();
        assert_eq!(transport.committed(&p()).await, Some(SourcePosition(4)));
        assert_eq!(
            transport.commit_history(&p()).await,
            vec![SourcePosition(4), SourcePosition(2)]
        );
    }
}
