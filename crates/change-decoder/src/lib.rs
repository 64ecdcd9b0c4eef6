//! Change event decoder and validator.
//!
//! Turns a [`RawEvent`] carrying a Debezium-style JSON envelope into a
//! [`ChangeRecord`], or explains why it cannot. Decoding is a pure function of
//! the event and the [`DecoderConfig`]: no I/O, no clocks, no panics on
//! malformed input.
//!
//! Operation codes:
//!
//! | `op` | Meaning          | Operation |
//! |------|------------------|-----------|
//! | `c`  | create           | Insert    |
//! | `r`  | snapshot read    | Insert    |
//! | `u`  | update           | Update    |
//! | `d`  | delete           | Delete    |

pub mod envelope;
pub mod error;
pub mod key;

use std::collections::BTreeMap;

use cdc_core::{ChangeRecord, Operation, RawEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use envelope::{Envelope, Payload, SourceInfo};
pub use error::{DecodeError, Result};

/// Validation rules applied to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Explicit primary-key columns per table, in key order
    pub key_columns: BTreeMap<String, Vec<String>>,
    /// Key column used when neither configuration nor message key names one
    pub default_key_column: String,
    /// Oldest accepted envelope schema version (inclusive)
    pub min_schema_version: u32,
    /// Newest accepted envelope schema version (inclusive)
    pub max_schema_version: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            key_columns: BTreeMap::new(),
            default_key_column: "id".to_string(),
            min_schema_version: 1,
            max_schema_version: 1,
        }
    }
}

/// Result of decoding one event that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A row-level change to apply
    Record(Box<ChangeRecord>),
    /// Nothing to apply, but the position is consumed (tombstones, heartbeats)
    Skip { reason: &'static str },
    /// A DDL event; the partition must stop until the schema is reconciled
    SchemaChange {
        table: Option<String>,
        ddl: Option<String>,
    },
}

/// Stateless decoder for one pipeline.
#[derive(Debug, Clone, Default)]
pub struct ChangeDecoder {
    config: DecoderConfig,
}

impl ChangeDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn decode(&self, event: &RawEvent) -> Result<Decoded> {
        let bytes = match event.payload.as_deref() {
            None | Some([]) => {
                return Ok(Decoded::Skip {
                    reason: "tombstone",
                })
            }
            Some(bytes) => bytes,
        };

        let envelope = Envelope::parse(bytes)?;
        self.check_schema_version(envelope.schema_version.as_ref())?;

        let Some(payload) = envelope.payload else {
            return Ok(Decoded::Skip {
                reason: "null payload",
            });
        };

        if payload.is_schema_change() {
            return Ok(Decoded::SchemaChange {
                table: payload.source.as_ref().and_then(|s| s.table.clone()),
                ddl: payload.ddl,
            });
        }

        let operation = match payload.op.as_deref() {
            None => {
                tracing::debug!(
                    "Skipping envelope without an operation at {} {}",
                    event.partition,
                    event.position
                );
                return Ok(Decoded::Skip {
                    reason: "no operation",
                })
            }
            Some("c") | Some("r") => Operation::Insert,
            Some("u") => Operation::Update,
            Some("d") => Operation::Delete,
            Some(other) => return Err(DecodeError::UnknownOperation(other.to_string())),
        };

        let table = source_table(&payload, &event.partition.topic)?;
        let message_key = key::parse_message_key(event.key.as_deref());

        let image = match operation {
            Operation::Insert | Operation::Update => {
                Some(payload.after.as_ref().ok_or(DecodeError::MissingImage {
                    operation,
                    image: "after",
                })?)
            }
            Operation::Delete => {
                if payload.before.is_none() && message_key.is_none() {
                    return Err(DecodeError::MissingImage {
                        operation,
                        image: "before",
                    });
                }
                payload.before.as_ref()
            }
        };

        let record_key = key::resolve_key(
            &table,
            self.config.key_columns.get(&table).map(Vec::as_slice),
            &self.config.default_key_column,
            image,
            message_key.as_ref(),
        )?;

        let commit_timestamp = payload
            .source
            .as_ref()
            .and_then(|s| s.ts_ms)
            .or(payload.ts_ms)
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        let after = match operation {
            Operation::Delete => None,
            _ => payload.after,
        };

        Ok(Decoded::Record(Box::new(ChangeRecord {
            source_table: table,
            operation,
            key: record_key,
            after,
            before: payload.before,
            position: event.position,
            partition: event.partition.clone(),
            commit_timestamp,
        })))
    }

    fn check_schema_version(&self, version: Option<&serde_json::Value>) -> Result<()> {
        let version = match version {
            None => 1,
            Some(v) => v
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| DecodeError::InvalidSchemaVersion(v.to_string()))?,
        };
        let (min, max) = (self.config.min_schema_version, self.config.max_schema_version);
        if version < min || version > max {
            return Err(DecodeError::SchemaVersionOutOfRange { version, min, max });
        }
        Ok(())
    }
}

/// `source.table`, falling back to the last dot-separated segment of the topic.
fn source_table(payload: &Payload, topic: &str) -> Result<String> {
    if let Some(table) = payload
        .source
        .as_ref()
        .and_then(|s| s.table.as_deref())
        .filter(|t| !t.is_empty())
    {
        return Ok(table.to_string());
    }
    match topic.rsplit('.').next() {
        Some(segment) if !segment.is_empty() => Ok(segment.to_string()),
        _ => Err(DecodeError::MissingTable {
            topic: topic.to_string(),
        }),
    }
}
