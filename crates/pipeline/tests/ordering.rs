#[macro_use]
mod common;

use std::sync::Arc;

use cdc_core::SourcePosition;
use common::{config, delete, id, insert, orders, update, users, Harness};
use dead_letter::MemoryDeadLetterSink;
use pipeline::PipelineConfig;
use serde_json::json;
use target_sink::MemoryTarget;
use transport::MemoryTransport;

async fn run_updates(config: PipelineConfig) -> Arc<MemoryTarget> {
    let transport = MemoryTransport::new();
    let p = users();
    transport.publish_json(&p, &insert(1, "10")).await;
    transport.publish_json(&p, &update(1, "20")).await;
    transport.publish_json(&p, &update(1, "30")).await;

    let target = Arc::new(MemoryTarget::new());
    let h = Harness::start(transport, target.clone(), MemoryDeadLetterSink::new(), config);
    eventually!("updates committed", h.committed(&p).await == Some(SourcePosition(2)));
    h.stop().await;
    target
}

#[tokio::test(start_paused = true)]
async fn test_final_state_reflects_highest_position() {
    for batch_size in [1, 2, 10] {
        let target = run_updates(PipelineConfig {
            batch_size,
            ..config()
        })
        .await;
        assert_eq!(
            target.row("users", &id(1)).await.unwrap()["email"],
            json!("30"),
            "batch size {batch_size}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_delete_then_reinsert_across_batches() {
    let transport = MemoryTransport::new();
    let p = users();
    transport.publish_json(&p, &insert(7, "first")).await;
    transport.publish_json(&p, &delete(7)).await;
    transport.publish_json(&p, &insert(7, "second")).await;
    transport.publish_json(&p, &insert(8, "other")).await;
    transport.publish_json(&p, &delete(8)).await;

    let h = Harness::start(
        transport,
        Arc::new(MemoryTarget::new()),
        MemoryDeadLetterSink::new(),
        PipelineConfig {
            batch_size: 2,
            ..config()
        },
    );
    eventually!("all committed", h.committed(&p).await == Some(SourcePosition(4)));
    assert_eq!(h.target.row("users", &id(7)).await.unwrap()["email"], json!("second"));
    assert!(h.target.row("users", &id(8)).await.is_none());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_partitions_progress_independently() {
    let transport = MemoryTransport::new();
    let (u, o) = (users(), orders());
    for i in 0..25 {
        transport.publish_json(&u, &insert(i, "u")).await;
    }
    transport.publish_json(&o, &insert(1, "o")).await;

    let h = Harness::with_defaults(transport);
    eventually!("users committed", h.committed(&u).await == Some(SourcePosition(24)));
    eventually!("orders committed", h.committed(&o).await == Some(SourcePosition(0)));
    assert_eq!(h.target.row_count("users").await, 25);
    assert_eq!(h.target.row_count("orders").await, 1);
    h.stop().await;
}
