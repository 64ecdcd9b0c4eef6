//! Primary-key resolution.

use cdc_core::{KeyColumn, KeyValue, RecordKey, Row};
use serde_json::{Map, Value};

use crate::error::{DecodeError, Result};

/// Parse a message key into its column map.
///
/// Debezium keys look like the value envelope: either `{"payload": {"id": 1}}`
/// or the bare `{"id": 1}`. Anything else (no key, non-JSON bytes, scalars) is
/// treated as an absent key.
pub fn parse_message_key(bytes: Option<&[u8]>) -> Option<Map<String, Value>> {
    let value: Value = serde_json::from_slice(bytes?).ok()?;
    let Value::Object(mut obj) = value else {
        return None;
    };
    if obj.len() <= 2 && obj.contains_key("payload") {
        return match obj.remove("payload") {
            Some(Value::Object(inner)) => Some(inner),
            _ => None,
        };
    }
    Some(obj)
}

/// Build the record key for `table`.
///
/// Resolution order: explicitly configured key columns, then the fields of
/// the message key, then `default_column`. Configured columns are looked up in
/// the row image first and the message key second.
pub fn resolve_key(
    table: &str,
    configured: Option<&[String]>,
    default_column: &str,
    image: Option<&Row>,
    message_key: Option<&Map<String, Value>>,
) -> Result<RecordKey> {
    if let Some(columns) = configured.filter(|c| !c.is_empty()) {
        let mut key = Vec::with_capacity(columns.len());
        for column in columns {
            let value = lookup(image, message_key, column).ok_or_else(|| {
                DecodeError::MissingPrimaryKey {
                    table: table.to_string(),
                    column: column.clone(),
                }
            })?;
            key.push(key_column(column, value)?);
        }
        return Ok(RecordKey::new(key));
    }

    if let Some(fields) = message_key.filter(|k| !k.is_empty()) {
        let mut key = Vec::with_capacity(fields.len());
        for (column, value) in fields {
            if value.is_null() {
                return Err(DecodeError::MissingPrimaryKey {
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
            key.push(key_column(column, value)?);
        }
        return Ok(RecordKey::new(key));
    }

    let value = lookup(image, message_key, default_column).ok_or_else(|| {
        DecodeError::MissingPrimaryKey {
            table: table.to_string(),
            column: default_column.to_string(),
        }
    })?;
    Ok(RecordKey::new(vec![key_column(default_column, value)?]))
}

fn lookup<'a>(
    image: Option<&'a Row>,
    message_key: Option<&'a Map<String, Value>>,
    column: &str,
) -> Option<&'a Value> {
    image
        .and_then(|row| row.get(column))
        .filter(|v| !v.is_null())
        .or_else(|| message_key.and_then(|k| k.get(column)))
        .filter(|v| !v.is_null())
}

fn key_column(column: &str, value: &Value) -> Result<KeyColumn> {
    let value = KeyValue::from_json(value).ok_or_else(|| DecodeError::InvalidKeyValue {
        column: column.to_string(),
        value: value.to_string(),
    })?;
    Ok(KeyColumn {
        name: column.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_message_key_shapes() {
        let wrapped = parse_message_key(Some(br#"{"schema": {}, "payload": {"id": 3}}"#));
        assert_eq!(wrapped.unwrap().get("id"), Some(&json!(3)));

        let bare = parse_message_key(Some(br#"{"id": 4}"#));
        assert_eq!(bare.unwrap().get("id"), Some(&json!(4)));

        assert!(parse_message_key(Some(b"plain-string-key")).is_none());
        assert!(parse_message_key(Some(b"42")).is_none());
        assert!(parse_message_key(None).is_none());
    }

    #[test]
    fn test_configured_columns_win() {
        let image = row(json!({"tenant": "acme", "id": 7, "name": "x"}));
        let configured = vec!["tenant".to_string(), "id".to_string()];
        let key = resolve_key("orders", Some(configured.as_slice()), "id", Some(&image), None).unwrap();
        assert_eq!(key.to_string(), "tenant='acme',id=7");
    }

    #[test]
    fn test_message_key_before_default() {
        let image = row(json!({"id": 7, "sku": "A-1"}));
        let mk = parse_message_key(Some(br#"{"sku": "A-1"}"#));
        let key = resolve_key("items", None, "id", Some(&image), mk.as_ref()).unwrap();
        assert_eq!(key.to_string(), "sku='A-1'");
    }

    #[test]
    fn test_default_column_fallback() {
        let image = row(json!({"id": 11, "email": "a@b"}));
        let key = resolve_key("users", None, "id", Some(&image), None).unwrap();
        assert_eq!(key, RecordKey::single("id", KeyValue::Int(11)));
    }

    #[test]
    fn test_missing_and_invalid_keys() {
        let image = row(json!({"email": "a@b", "score": 1.5, "nullable": null}));
        assert!(matches!(
            resolve_key("users", None, "id", Some(&image), None),
            Err(DecodeError::MissingPrimaryKey { .. })
        ));

        let configured = vec!["score".to_string()];
        assert!(matches!(
            resolve_key("users", Some(configured.as_slice()), "id", Some(&image), None),
            Err(DecodeError::InvalidKeyValue { .. })
        ));

        let configured = vec!["nullable".to_string()];
        assert!(matches!(
            resolve_key("users", Some(configured.as_slice()), "id", Some(&image), None),
            Err(DecodeError::MissingPrimaryKey { .. })
        ));
    }

    #[test]
    fn test_configured_column_from_message_key() {
        let mk = parse_message_key(Some(br#"{"id": 5}"#));
        let configured = vec!["id".to_string()];
        let key = resolve_key("users", Some(configured.as_slice()), "id", None, mk.as_ref()).unwrap();
        assert_eq!(key, RecordKey::single("id", KeyValue::Int(5)));
    }
}
