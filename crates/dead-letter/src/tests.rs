//! Unit tests for the dead-letter crate.

use std::sync::Arc;

use cdc_core::{PartitionId, SourcePosition};
use chrono::Utc;

use crate::{
    DeadLetterError, DeadLetterRecord, DeadLetterRouter, DeadLetterSink, Failure, FailureKind,
    JsonlDeadLetterSink, MemoryDeadLetterSink, PayloadEncoding, WriteOutcome,
};

fn failure<'a>(partition: &'a PartitionId, position: u64, payload: &'a [u8]) -> Failure<'a> {
    Failure {
        partition,
        position: SourcePosition(position),
        payload: Some(payload),
        reason: "missing_primary_key: column 'id' missing".to_string(),
        kind: FailureKind::Validation,
        attempt_count: 1,
        first_failed_at: Utc::now(),
    }
}

// ============================================================================
// Payload Encoding Tests
// ============================================================================

#[test]
fn test_utf8_payload_kept_as_text() {
    let (text, encoding) = DeadLetterRecord::encode_payload(Some(br#"{"op":"c"}"#));
    assert_eq!(text, r#"{"op":"c"}"#);
    assert_eq!(encoding, PayloadEncoding::Utf8);
}

#[test]
fn test_binary_payload_base64_round_trip() {
    let bytes = [0xff, 0xfe, 0x00, 0x41];
    let (text, encoding) = DeadLetterRecord::encode_payload(Some(&bytes));
    assert_eq!(encoding, PayloadEncoding::Base64);

    let record = DeadLetterRecord {
        original_payload: text,
        payload_encoding: encoding,
        failure_reason: "bad".to_string(),
        failure_kind: FailureKind::Validation,
        first_failed_at: Utc::now(),
        attempt_count: 1,
        partition: PartitionId::new("t", 0),
        position: SourcePosition(1),
    };
    assert_eq!(record.payload_bytes().unwrap(), bytes.to_vec());
}

#[test]
fn test_source_key_names_partition_and_position() {
    let record = DeadLetterRecord {
        original_payload: "not json".to_string(),
        payload_encoding: PayloadEncoding::Utf8,
        failure_reason: "invalid JSON".to_string(),
        failure_kind: FailureKind::Validation,
        first_failed_at: Utc::now(),
        attempt_count: 1,
        partition: PartitionId::new("cdc.public.users", 1),
        position: SourcePosition(9),
    };
    assert_eq!(record.source_key(), "cdc.public.users[1]@9");
}

#[test]
fn test_tombstone_payload_is_empty() {
    let (text, encoding) = DeadLetterRecord::encode_payload(None);
    assert!(text.is_empty());
    assert_eq!(encoding, PayloadEncoding::Utf8);
}

// ============================================================================
// Router Tests
// ============================================================================

#[tokio::test]
async fn test_router_counts_per_partition() {
    let sink = MemoryDeadLetterSink::new();
    let router = DeadLetterRouter::new(Arc::new(sink.clone()));
    let a = PartitionId::new("cdc.public.users", 0);
    let b = PartitionId::new("cdc.public.users", 1);

    router.route(failure(&a, 3, b"x")).await.unwrap();
    router.route(failure(&a, 9, b"y")).await.unwrap();
    router.route(failure(&b, 1, b"z")).await.unwrap();

    assert_eq!(router.count(&a).await, 2);
    assert_eq!(router.count(&b).await, 1);
    assert_eq!(router.total().await, 3);

    let stored = sink.records().await;
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[1].position, SourcePosition(9));
    assert_eq!(stored[1].failure_kind, FailureKind::Validation);
}

#[tokio::test]
async fn test_router_does_not_count_failed_writes() {
    let sink = MemoryDeadLetterSink::new();
    sink.set_unavailable(true);
    let router = DeadLetterRouter::new(Arc::new(sink.clone()));
    let a = PartitionId::new("t", 0);

    let err = router.route(failure(&a, 1, b"x")).await.unwrap_err();
    assert!(matches!(err, DeadLetterError::Unavailable(_)));
    assert_eq!(router.count(&a).await, 0);

    sink.set_unavailable(false);
    router.route(failure(&a, 1, b"x")).await.unwrap();
    assert_eq!(router.count(&a).await, 1);
}

#[tokio::test]
async fn test_router_ignores_requarantined_position() {
    let sink = MemoryDeadLetterSink::new();
    let router = DeadLetterRouter::new(Arc::new(sink.clone()));
    let a = PartitionId::new("cdc.public.users", 0);

    assert!(router.route(failure(&a, 0, b"garbage")).await.unwrap().is_some());
    assert!(router.route(failure(&a, 0, b"garbage")).await.unwrap().is_none());
    assert!(router.route(failure(&a, 1, b"garbage")).await.unwrap().is_some());

    assert_eq!(router.count(&a).await, 2);
    assert_eq!(sink.len().await, 2);
}

// ============================================================================
// JSONL Sink Tests
// ============================================================================

#[tokio::test]
async fn test_jsonl_sink_appends_lines() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("nested").join("dead_letters.jsonl");
    let router = DeadLetterRouter::new(Arc::new(JsonlDeadLetterSink::new(&path)));
    assert!(router.sink_description().starts_with("file:"));

    let a = PartitionId::new("cdc.public.users", 2);
    router.route(failure(&a, 10, br#"{"op":"x"}"#)).await.unwrap();
    router.route(failure(&a, 11, &[0xff])).await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: DeadLetterRecord = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.original_payload, r#"{"op":"x"}"#);
    assert_eq!(first.partition, a);

    let second: DeadLetterRecord = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second.payload_encoding, PayloadEncoding::Base64);
    assert_eq!(second.payload_bytes().unwrap(), vec![0xff]);
}

#[tokio::test]
async fn test_jsonl_sink_concurrent_writers() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("dead_letters.jsonl");
    let router = Arc::new(DeadLetterRouter::new(Arc::new(JsonlDeadLetterSink::new(
        &path,
    ))));

    let mut handles = Vec::new();
    for partition in 0..4 {
        let router = Arc::clone(&router);
        handles.push(tokio::spawn(async move {
            let p = PartitionId::new("t", partition);
            for position in 0..25 {
                router.route(failure(&p, position, b"{}")).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 100);
    for line in content.lines() {
        serde_json::from_str::<DeadLetterRecord>(line).unwrap();
    }
    assert_eq!(router.total().await, 100);
}

#[tokio::test]
async fn test_jsonl_sink_skips_positions_already_in_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("dead_letters.jsonl");
    let a = PartitionId::new("cdc.public.users", 0);

    let first = DeadLetterRouter::new(Arc::new(JsonlDeadLetterSink::new(&path)));
    first.route(failure(&a, 0, b"garbage")).await.unwrap();

    // A fresh sink over the same file, as after a process restart
    let sink = JsonlDeadLetterSink::new(&path);
    let (original_payload, payload_encoding) = DeadLetterRecord::encode_payload(Some(b"garbage"));
    let again = DeadLetterRecord {
        original_payload,
        payload_encoding,
        failure_reason: "invalid_json".to_string(),
        failure_kind: FailureKind::Validation,
        first_failed_at: Utc::now(),
        attempt_count: 1,
        partition: a.clone(),
        position: SourcePosition(0),
    };
    assert_eq!(sink.write(&again).await.unwrap(), WriteOutcome::Duplicate);
    let next = DeadLetterRecord {
        position: SourcePosition(3),
        ..again
    };
    assert_eq!(sink.write(&next).await.unwrap(), WriteOutcome::Stored);

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 2);
}
