//! Dead-letter handling for cdc-migrate
//!
//! Change events that can never be applied (malformed payloads, rows the
//! target rejects on every attempt) are quarantined here so the partition can
//! keep moving. A dead letter is never read back by the pipeline.
//!
//! Records are identified by their source position. An event redelivered
//! after a restart is quarantined again, so every sink stores at most one
//! record per `(partition, position)` and reports the repeat as
//! [`WriteOutcome::Duplicate`].
//!
//! # Architecture
//!
//! - [`DeadLetterRecord`] - Immutable description of one quarantined event
//! - [`DeadLetterSink`] - Write-only storage backend trait
//! - [`JsonlDeadLetterSink`] - Appends one JSON document per line to a file
//! - [`MemoryDeadLetterSink`] - Keeps records in memory, for tests and dry runs
//! - [`DeadLetterRouter`] - Shared front door used by every partition worker
//!
//! Other sinks live next to the systems they write to: the `_cdc_dead_letters`
//! table in the postgres-sink crate and the Kafka topic sink in kafka-source.

mod file;
mod memory;
mod router;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use base64::Engine;
use cdc_core::{PartitionId, SourcePosition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use file::JsonlDeadLetterSink;
pub use memory::MemoryDeadLetterSink;
pub use router::{DeadLetterRouter, Failure};

/// How `original_payload` is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

impl PayloadEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadEncoding::Utf8 => "utf8",
            PayloadEncoding::Base64 => "base64",
        }
    }
}

/// Why an event ended up in the dead-letter sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rejected by the decoder; never retried
    Validation,
    /// Rejected by the target on every attempt of its retry budget
    PersistentData,
    /// Transient failures exhausted the retry budget for a single record
    RetriesExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::PersistentData => "persistent_data",
            FailureKind::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One quarantined change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Event payload exactly as delivered, empty for tombstones
    pub original_payload: String,
    pub payload_encoding: PayloadEncoding,
    pub failure_reason: String,
    pub failure_kind: FailureKind,
    pub first_failed_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub partition: PartitionId,
    pub position: SourcePosition,
}

impl DeadLetterRecord {
    /// Encode `payload` as UTF-8 text when possible, base64 otherwise.
    pub fn encode_payload(payload: Option<&[u8]>) -> (String, PayloadEncoding) {
        let bytes = payload.unwrap_or_default();
        match std::str::from_utf8(bytes) {
            Ok(text) => (text.to_string(), PayloadEncoding::Utf8),
            Err(_) => (
                base64::engine::general_purpose::STANDARD.encode(bytes),
                PayloadEncoding::Base64,
            ),
        }
    }

    /// Identity of the quarantined event, e.g. `cdc.public.users[0]@42`.
    pub fn source_key(&self) -> String {
        format!("{}@{}", self.partition, self.position)
    }

    /// Recover the original payload bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        match self.payload_encoding {
            PayloadEncoding::Utf8 => Ok(self.original_payload.clone().into_bytes()),
            PayloadEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(&self.original_payload)
                .map_err(|e| DeadLetterError::Encoding(e.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("Dead-letter sink unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Payload encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, DeadLetterError>;

/// Result of a successful sink write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    /// A record for the same partition and position was already stored
    Duplicate,
}

/// Write-only storage for dead letters.
///
/// Implementations must be safe to call from every partition worker at once.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Durably store one record unless its source position is already
    /// stored. An `Err` means nothing was stored.
    async fn write(&self, record: &DeadLetterRecord) -> Result<WriteOutcome>;

    /// Short description for logs, e.g. `file:/var/lib/cdc/dead_letters.jsonl`.
    fn describe(&self) -> String;
}
