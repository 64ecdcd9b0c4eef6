use std::time::Duration;

/// Configuration for the Kafka transport
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,
    /// Consumer group ID
    ///
    /// Offsets are committed to this group after every applied batch. The
    /// target's offset ledger stays authoritative; the group offsets let
    /// standard Kafka tooling show consumer lag.
    pub group_id: String,
    /// Explicit topics to consume
    pub topics: Vec<String>,
    /// Consume every topic whose name starts with this prefix
    /// (e.g. `cdc.public.`). Combined with `topics`.
    pub topic_prefix: Option<String>,
    /// Session timeout in milliseconds
    pub session_timeout_ms: String,
    /// Timeout for metadata and watermark requests
    pub metadata_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "cdc-migration-consumer".to_string(),
            topics: Vec::new(),
            topic_prefix: Some("cdc.public.".to_string()),
            session_timeout_ms: "30000".to_string(),
            metadata_timeout: Duration::from_secs(10),
        }
    }
}

impl KafkaConfig {
    /// Whether `topic` is selected by the configured list or prefix.
    pub fn selects(&self, topic: &str) -> bool {
        if topic.starts_with("__") {
            return false;
        }
        self.topics.iter().any(|t| t == topic)
            || self
                .topic_prefix
                .as_deref()
                .is_some_and(|prefix| !prefix.is_empty() && topic.starts_with(prefix))
    }
}
