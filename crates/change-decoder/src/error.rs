use cdc_core::Operation;
use thiserror::Error;

/// Why a change event was rejected.
///
/// Every variant is a validation failure: the event is routed to the
/// dead-letter sink and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Envelope is malformed: {0}")]
    MalformedEnvelope(String),

    #[error("Unrecognized operation type '{0}'")]
    UnknownOperation(String),

    #[error("{operation} event has no '{image}' row image")]
    MissingImage {
        operation: Operation,
        image: &'static str,
    },

    #[error("Cannot determine source table (no source.table and topic '{topic}' has no name segment)")]
    MissingTable { topic: String },

    #[error("Primary key column '{column}' missing for table '{table}'")]
    MissingPrimaryKey { table: String, column: String },

    #[error("Primary key column '{column}' has unsupported value {value}")]
    InvalidKeyValue { column: String, value: String },

    #[error("Invalid schema version: {0}")]
    InvalidSchemaVersion(String),

    #[error("Schema version {version} outside compatibility window [{min}, {max}]")]
    SchemaVersionOutOfRange { version: u32, min: u32, max: u32 },
}

impl DecodeError {
    /// Short machine-readable tag stored as the dead letter's failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::InvalidJson(_) => "invalid_json",
            DecodeError::MalformedEnvelope(_) => "malformed_envelope",
            DecodeError::UnknownOperation(_) => "unknown_operation",
            DecodeError::MissingImage { .. } => "missing_image",
            DecodeError::MissingTable { .. } => "missing_table",
            DecodeError::MissingPrimaryKey { .. } => "missing_primary_key",
            DecodeError::InvalidKeyValue { .. } => "invalid_key_value",
            DecodeError::InvalidSchemaVersion(_) => "invalid_schema_version",
            DecodeError::SchemaVersionOutOfRange { .. } => "schema_version_out_of_range",
        }
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;
