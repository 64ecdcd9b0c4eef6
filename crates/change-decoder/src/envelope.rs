//! Debezium JSON envelope layout.
//!
//! Connectors emit either the full envelope with an embedded schema
//! (`{"schema": {...}, "payload": {...}}`) or, with schemas disabled, the bare
//! payload object. Both shapes are accepted.

use cdc_core::Row;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{DecodeError, Result};

/// Change payload carried inside the envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub before: Option<Row>,
    #[serde(default)]
    pub after: Option<Row>,
    #[serde(default)]
    pub source: Option<SourceInfo>,
    #[serde(default)]
    pub ts_ms: Option<i64>,
    /// Present on schema-change events
    #[serde(default)]
    pub ddl: Option<String>,
    #[serde(default, rename = "historyRecord")]
    pub history_record: Option<Value>,
}

impl Payload {
    pub fn is_schema_change(&self) -> bool {
        self.ddl.is_some() || self.history_record.is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceInfo {
    #[serde(default)]
    pub db: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub ts_ms: Option<i64>,
}

/// A parsed envelope. `payload` is `None` for an explicit `"payload": null`.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub schema_version: Option<Value>,
    pub payload: Option<Payload>,
}

impl Envelope {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            Value::Null => {
                return Ok(Self {
                    schema_version: None,
                    payload: None,
                })
            }
            other => {
                return Err(DecodeError::MalformedEnvelope(format!(
                    "expected a JSON object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let wrapped = obj.contains_key("payload") && !obj.contains_key("op");
        if !wrapped {
            let payload = deserialize_payload(Value::Object(obj))?;
            return Ok(Self {
                schema_version: None,
                payload: Some(payload),
            });
        }

        let schema_version = obj
            .get("schema")
            .and_then(|s| s.get("version"))
            .filter(|v| !v.is_null())
            .cloned();
        let payload = match obj.remove("payload") {
            None | Some(Value::Null) => None,
            Some(inner @ Value::Object(_)) => Some(deserialize_payload(inner)?),
            Some(other) => {
                return Err(DecodeError::MalformedEnvelope(format!(
                    "'payload' must be an object, got {}",
                    json_type_name(&other)
                )))
            }
        };
        Ok(Self {
            schema_version,
            payload,
        })
    }
}

fn deserialize_payload(value: Value) -> Result<Payload> {
    serde_json::from_value(value).map_err(|e| DecodeError::MalformedEnvelope(e.to_string()))
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
