//! Kafka adapters for cdc-migrate.
//!
//! - [`KafkaTransport`] reads Debezium-style change topics, one manually
//!   assigned consumer per topic partition, committing offsets only when the
//!   pipeline says a batch is durable.
//! - [`KafkaDeadLetterSink`] publishes dead letters to a topic.

pub mod config;
mod consumer;
mod dead_letters;

pub use config::KafkaConfig;
pub use consumer::{
    head_from_watermarks, start_offset, to_raw_event, KafkaPartitionStream, KafkaTransport,
};
pub use dead_letters::KafkaDeadLetterSink;
