#[macro_use]
mod common;

use cdc_core::{PartitionId, SourcePosition};
use common::{id, insert, schema_change, users, Harness};
use pipeline::{ControlError, WorkerState};
use transport::MemoryTransport;

#[tokio::test(start_paused = true)]
async fn test_schema_change_blocks_until_resumed() {
    let transport = MemoryTransport::new();
    let p = users();
    transport.publish_json(&p, &insert(1, "before")).await;
    transport.publish_json(&p, &schema_change("users")).await;
    transport.publish_json(&p, &insert(2, "after")).await;

    let h = Harness::with_defaults(transport);
    eventually!(
        "partition to block",
        matches!(
            h.control.worker_states().get(&p),
            Some(WorkerState::Blocked { .. })
        )
    );
    // The batch before the schema change was flushed; nothing after it applied
    assert_eq!(h.committed(&p).await, Some(SourcePosition(0)));
    assert!(h.target.row("users", &id(1)).await.is_some());
    assert!(h.target.row("users", &id(2)).await.is_none());
    assert_eq!(
        h.control.worker_states().get(&p),
        Some(&WorkerState::Blocked {
            position: SourcePosition(1),
            table: Some("users".to_string()),
        })
    );

    h.control.resume_partition(&p).unwrap();
    eventually!("remaining events committed", h.committed(&p).await == Some(SourcePosition(2)));
    assert!(h.target.row("users", &id(2)).await.is_some());
    assert_eq!(
        h.control.worker_states().get(&p),
        Some(&WorkerState::Streaming)
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_resume_requires_a_blocked_partition() {
    let transport = MemoryTransport::new();
    let p = users();
    transport.publish_json(&p, &insert(1, "x")).await;

    let h = Harness::with_defaults(transport);
    eventually!("committed", h.committed(&p).await == Some(SourcePosition(0)));

    assert!(matches!(
        h.control.resume_partition(&p),
        Err(ControlError::NotBlocked { .. })
    ));
    let unknown = PartitionId::new("cdc.public.nope", 0);
    assert_eq!(
        h.control.resume_partition(&unknown),
        Err(ControlError::UnknownPartition(unknown.clone()))
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_blocked_leaves_schema_change_uncommitted() {
    let transport = MemoryTransport::new();
    let p = users();
    transport.publish_json(&p, &schema_change("users")).await;

    let h = Harness::with_defaults(transport);
    eventually!(
        "partition to block",
        matches!(
            h.control.worker_states().get(&p),
            Some(WorkerState::Blocked { .. })
        )
    );
    let summary = h.stop().await;
    assert!(matches!(
        summary.workers[&p],
        pipeline::WorkerOutcome::Stopped(_)
    ));
    assert_eq!(summary.totals.batches, 0);
}
