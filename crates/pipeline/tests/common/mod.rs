#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cdc_core::{KeyValue, PartitionId, RecordKey, SourcePosition};
use change_decoder::ChangeDecoder;
use dead_letter::{DeadLetterRouter, MemoryDeadLetterSink};
use offset_ledger::OffsetLedger;
use pipeline::{ControlHandle, Coordinator, PipelineConfig, RetryPolicy, RunSummary};
use serde_json::{json, Value};
use target_sink::MemoryTarget;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use transport::MemoryTransport;

/// Poll `$cond` on the (paused) test clock until it holds.
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let mut polls = 0u32;
        loop {
            if $cond {
                break;
            }
            polls += 1;
            assert!(polls < 3000, "timed out waiting for {}", $what);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn users() -> PartitionId {
    PartitionId::new("cdc.public.users", 0)
}

pub fn orders() -> PartitionId {
    PartitionId::new("cdc.public.orders", 0)
}

pub fn id(value: i64) -> RecordKey {
    RecordKey::single("id", KeyValue::Int(value))
}

pub fn insert(id: i64, email: &str) -> Value {
    json!({"op": "c", "after": {"id": id, "email": email}})
}

pub fn update(id: i64, email: &str) -> Value {
    json!({"op": "u", "before": {"id": id}, "after": {"id": id, "email": email}})
}

pub fn delete(id: i64) -> Value {
    json!({"op": "d", "before": {"id": id}})
}

pub fn schema_change(table: &str) -> Value {
    json!({
        "ddl": format!("ALTER TABLE {table} ADD COLUMN age INT"),
        "source": {"table": table}
    })
}

/// Small batches and fast retries.
pub fn config() -> PipelineConfig {
    PipelineConfig {
        batch_size: 10,
        batch_wait: Duration::from_millis(100),
        poll_timeout: Duration::from_millis(50),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        },
        data_error_attempts: 2,
        lag_poll_interval: Duration::from_millis(100),
        dwell: Duration::from_secs(1),
        shutdown_deadline: Duration::from_secs(5),
        max_pause: Duration::from_secs(1),
    }
}

pub struct Harness {
    pub transport: MemoryTransport,
    pub target: Arc<MemoryTarget>,
    pub sink: MemoryDeadLetterSink,
    pub control: ControlHandle,
    shutdown: Arc<Notify>,
    run: JoinHandle<RunSummary>,
}

impl Harness {
    pub fn start(
        transport: MemoryTransport,
        target: Arc<MemoryTarget>,
        sink: MemoryDeadLetterSink,
        config: PipelineConfig,
    ) -> Self {
        init_tracing();
        let router = Arc::new(DeadLetterRouter::new(Arc::new(sink.clone())));
        let coordinator = Coordinator::new(
            Arc::new(transport.clone()),
            target.clone(),
            ChangeDecoder::default(),
            router,
            config,
        );
        let control = coordinator.control();
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);
        let run = tokio::spawn(async move {
            coordinator
                .run(async move { signal.notified().await })
                .await
                .expect("partition discovery failed")
        });
        Self {
            transport,
            target,
            sink,
            control,
            shutdown,
            run,
        }
    }

    pub fn with_defaults(transport: MemoryTransport) -> Self {
        Self::start(
            transport,
            Arc::new(MemoryTarget::new()),
            MemoryDeadLetterSink::new(),
            config(),
        )
    }

    pub async fn committed(&self, partition: &PartitionId) -> Option<SourcePosition> {
        self.target
            .read_offset(partition)
            .await
            .expect("memory ledger read")
            .map(|r| r.committed_position)
    }

    pub async fn stop(self) -> RunSummary {
        self.shutdown.notify_one();
        self.run.await.expect("coordinator task panicked")
    }
}
