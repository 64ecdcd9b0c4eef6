//! Canonical change record produced by the decoder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::position::{PartitionId, SourcePosition};

/// Column name to value mapping for a row image.
pub type Row = BTreeMap<String, serde_json::Value>;

/// Row-level operation captured at the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single primary-key column value.
///
/// Only types with a stable total order are accepted as key values; floating
/// point and structured values are rejected by the decoder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl KeyValue {
    /// Convert a JSON scalar into a key value.
    ///
    /// Returns `None` for nulls, floats, arrays and objects.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map(Self::Int),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "'{s}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyColumn {
    pub name: String,
    pub value: KeyValue,
}

/// Ordered tuple of primary-key columns identifying a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(Vec<KeyColumn>);

impl RecordKey {
    pub fn new(columns: Vec<KeyColumn>) -> Self {
        Self(columns)
    }

    /// Shorthand for the common single `id` column key.
    pub fn single(name: impl Into<String>, value: KeyValue) -> Self {
        Self(vec![KeyColumn {
            name: name.into(),
            value,
        }])
    }

    pub fn columns(&self) -> &[KeyColumn] {
        &self.0
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|c| c.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON object of key column names to values.
    pub fn to_json_object(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .0
            .iter()
            .map(|c| (c.name.clone(), c.value.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for column in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", column.name, column.value)?;
            first = false;
        }
        Ok(())
    }
}

/// Normalized unit representing one row-level change from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Logical table the change belongs to
    pub source_table: String,
    pub operation: Operation,
    pub key: RecordKey,
    /// Row image after the change; present for Insert/Update, absent for Delete
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub after: Option<Row>,
    /// Row image before the change, kept for diagnostics only
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub before: Option<Row>,
    pub position: SourcePosition,
    pub partition: PartitionId,
    /// Source commit time. Observability only, never used for ordering.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    pub fn insert(
        partition: PartitionId,
        position: SourcePosition,
        table: impl Into<String>,
        key: RecordKey,
        after: Row,
    ) -> Self {
        Self::with_image(partition, position, table, Operation::Insert, key, after)
    }

    pub fn update(
        partition: PartitionId,
        position: SourcePosition,
        table: impl Into<String>,
        key: RecordKey,
        after: Row,
    ) -> Self {
        Self::with_image(partition, position, table, Operation::Update, key, after)
    }

    pub fn delete(
        partition: PartitionId,
        position: SourcePosition,
        table: impl Into<String>,
        key: RecordKey,
    ) -> Self {
        Self {
            source_table: table.into(),
            operation: Operation::Delete,
            key,
            after: None,
            before: None,
            position,
            partition,
            commit_timestamp: None,
        }
    }

    fn with_image(
        partition: PartitionId,
        position: SourcePosition,
        table: impl Into<String>,
        operation: Operation,
        key: RecordKey,
        after: Row,
    ) -> Self {
        Self {
            source_table: table.into(),
            operation,
            key,
            after: Some(after),
            before: None,
            position,
            partition,
            commit_timestamp: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }
}
