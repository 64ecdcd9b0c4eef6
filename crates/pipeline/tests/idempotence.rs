#[macro_use]
mod common;

use std::sync::Arc;

use cdc_core::SourcePosition;
use common::{config, id, insert, update, users, Harness};
use dead_letter::MemoryDeadLetterSink;
use pipeline::WorkerOutcome;
use serde_json::json;
use target_sink::MemoryTarget;
use transport::MemoryTransport;

#[tokio::test(start_paused = true)]
async fn test_restart_redelivers_without_reapplying() {
    let transport = MemoryTransport::new();
    let p = users();
    transport.publish_json(&p, &insert(1, "a@example.com")).await;
    transport.publish_json(&p, &insert(2, "b@example.com")).await;
    transport.publish_json(&p, &update(1, "a2@example.com")).await;
    transport.publish_json(&p, &insert(3, "c@example.com")).await;

    let target = Arc::new(MemoryTarget::new());
    let first = Harness::start(
        transport.clone(),
        target.clone(),
        MemoryDeadLetterSink::new(),
        config(),
    );
    eventually!("first run to commit", first.committed(&p).await == Some(SourcePosition(3)));
    first.stop().await;

    let rows_before = target.rows("users").await;
    let writes_before = target.ledger_writes().await;
    let applies_before = target.apply_calls();

    // Same source, same target: the stream resumes at the committed position
    let second = Harness::start(
        transport.clone(),
        target.clone(),
        MemoryDeadLetterSink::new(),
        config(),
    );
    eventually!(
        "second run to see the redelivered event",
        second.control.status().await.partitions.first().map(|s| s.metrics.events) == Some(1)
    );
    let summary = second.stop().await;

    assert_eq!(target.rows("users").await, rows_before);
    assert_eq!(target.ledger_writes().await, writes_before);
    assert_eq!(target.apply_calls(), applies_before);
    assert_eq!(summary.totals.skipped, 1);
    assert_eq!(summary.totals.applied, 0);
    assert_eq!(
        target.row("users", &id(1)).await.unwrap()["email"],
        json!("a2@example.com")
    );
    match &summary.workers[&p] {
        WorkerOutcome::Stopped(worker) => assert_eq!(worker.committed, Some(SourcePosition(3))),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_events_converge_to_same_state() {
    let transport = MemoryTransport::new();
    let p = users();
    // The connector re-emitted the same changes after its own restart
    for _ in 0..2 {
        transport.publish_json(&p, &insert(1, "a@example.com")).await;
        transport.publish_json(&p, &update(1, "b@example.com")).await;
    }

    let h = Harness::with_defaults(transport);
    eventually!("all four events committed", h.committed(&p).await == Some(SourcePosition(3)));
    assert_eq!(h.target.row_count("users").await, 1);
    assert_eq!(
        h.target.row("users", &id(1)).await.unwrap()["email"],
        json!("b@example.com")
    );
    h.stop().await;
}
