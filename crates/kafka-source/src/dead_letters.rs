//! Dead-letter topic sink.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterSink, WriteOutcome};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::Mutex;

/// Publishes dead letters as JSON to a Kafka topic, keyed by `partition@position`.
///
/// Repeats are suppressed for the life of the process. A topic cannot be
/// queried for existing keys, so across restarts the message key is what
/// lets a compacted topic keep one record per source position.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
    published: Mutex<HashSet<String>>,
}

impl KafkaDeadLetterSink {
    pub fn new(brokers: &str, topic: impl Into<String>) -> dead_letter::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| {
                DeadLetterError::Unavailable(format!("Failed to create Kafka producer: {e}"))
            })?;
        Ok(Self {
            producer,
            topic: topic.into(),
            published: Mutex::new(HashSet::new()),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn write(&self, record: &DeadLetterRecord) -> dead_letter::Result<WriteOutcome> {
        let key = record.source_key();
        let mut published = self.published.lock().await;
        if published.contains(&key) {
            return Ok(WriteOutcome::Duplicate);
        }

        let payload = serde_json::to_vec(record)?;
        let message = FutureRecord::to(&self.topic).key(&key).payload(&payload);
        self.producer
            .send(message, Duration::from_secs(5))
            .await
            .map_err(|(err, _)| {
                DeadLetterError::Unavailable(format!(
                    "Failed to publish dead letter to topic '{}': {err}",
                    self.topic
                ))
            })?;
        tracing::debug!("Published dead letter {} to {}", key, self.topic);
        published.insert(key);
        Ok(WriteOutcome::Stored)
    }

    fn describe(&self) -> String {
        format!("topic:{}", self.topic)
    }
}
