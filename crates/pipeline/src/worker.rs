//! One worker per partition: consume, batch, apply, commit.

use std::collections::BTreeMap;
use std::sync::Arc;

use cdc_core::{Batch, PartitionId, RawEvent, SourcePosition};
use change_decoder::{ChangeDecoder, Decoded};
use chrono::{DateTime, Utc};
use dead_letter::{DeadLetterRouter, Failure, FailureKind};
use offset_ledger::LedgerError;
use serde::Serialize;
use target_sink::{ApplyOutcome, RecordRef, TargetStore};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use transport::{PartitionStream, Transport};

use crate::config::PipelineConfig;
use crate::error::WorkerError;
use crate::lag::LagMonitor;
use crate::metrics::{Metrics, PartitionMetrics};
use crate::pause::PauseGate;
use crate::state::WorkerState;

/// Everything the workers of one pipeline share.
pub struct WorkerContext {
    pub transport: Arc<dyn Transport>,
    pub target: Arc<dyn TargetStore>,
    pub decoder: Arc<ChangeDecoder>,
    pub router: Arc<DeadLetterRouter>,
    pub pause: Arc<PauseGate>,
    pub lag: Arc<LagMonitor>,
    pub metrics: Arc<Metrics>,
    pub config: PipelineConfig,
}

/// What a worker reports when it stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub partition: PartitionId,
    pub committed: Option<SourcePosition>,
}

/// Records of the open batch plus the raw payloads needed to dead-letter them.
struct PendingBatch {
    batch: Batch,
    payloads: BTreeMap<SourcePosition, Option<Vec<u8>>>,
    events: usize,
    opened_at: Option<Instant>,
}

impl PendingBatch {
    fn new(partition: &PartitionId, committed: Option<SourcePosition>) -> Self {
        Self {
            batch: Batch::for_partition(partition.clone(), committed),
            payloads: BTreeMap::new(),
            events: 0,
            opened_at: None,
        }
    }

    fn touch(&mut self) {
        self.events += 1;
        self.opened_at.get_or_insert_with(Instant::now);
    }

    fn push(&mut self, record: cdc_core::ChangeRecord, payload: Option<Vec<u8>>) {
        self.touch();
        self.payloads.insert(record.position, payload);
        self.batch.push(record);
    }

    /// Consume a position that produced no record.
    fn observe(&mut self, partition: &PartitionId, position: SourcePosition) {
        self.touch();
        self.batch.observe_position(partition, position);
    }

    fn is_empty(&self) -> bool {
        self.events == 0
    }

    /// Take a record out of the batch, keeping its position consumed.
    fn extract(&mut self, record: &RecordRef) -> Option<Vec<u8>> {
        if let Some(index) = self.batch.find(&record.partition, record.position) {
            self.batch.remove(index);
        }
        self.payloads.remove(&record.position).flatten()
    }
}

/// Control side of a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    pub partition: PartitionId,
    pub state: watch::Receiver<WorkerState>,
    pub resume: Arc<Notify>,
}

pub struct PartitionWorker {
    partition: PartitionId,
    ctx: Arc<WorkerContext>,
    metrics: Arc<PartitionMetrics>,
    state: watch::Sender<WorkerState>,
    resume: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    committed: Option<SourcePosition>,
}

impl PartitionWorker {
    pub fn new(
        partition: PartitionId,
        ctx: Arc<WorkerContext>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, WorkerHandle) {
        let (state, state_rx) = watch::channel(WorkerState::Idle);
        let resume = Arc::new(Notify::new());
        let metrics = ctx.metrics.partition(&partition);
        let handle = WorkerHandle {
            partition: partition.clone(),
            state: state_rx,
            resume: Arc::clone(&resume),
        };
        let worker = Self {
            partition,
            ctx,
            metrics,
            state,
            resume,
            shutdown,
            committed: None,
        };
        (worker, handle)
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub async fn run(mut self) -> Result<WorkerSummary, WorkerError> {
        let result = self.run_inner().await;
        match &result {
            Ok(_) => {
                tracing::info!(
                    "Worker for {} stopped at committed position {:?}",
                    self.partition,
                    self.committed
                );
                self.set_state(WorkerState::Stopped);
            }
            Err(e) => {
                tracing::error!("Worker for {} halted: {}", self.partition, e);
                self.set_state(WorkerState::Halted {
                    reason: e.to_string(),
                });
            }
        }
        result.map(|()| WorkerSummary {
            partition: self.partition.clone(),
            committed: self.committed,
        })
    }

    fn set_state(&self, state: WorkerState) {
        tracing::debug!("Worker {} -> {}", self.partition, state);
        self.state.send_replace(state);
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run_inner(&mut self) -> Result<(), WorkerError> {
        self.set_state(WorkerState::Resuming);
        self.committed = self.read_committed().await?;
        if let Some(committed) = self.committed {
            self.ctx.lag.record_committed(&self.partition, committed).await;
        }
        let mut stream = self.open_stream().await?;
        tracing::info!(
            "Worker for {} streaming from committed position {:?}",
            self.partition,
            self.committed
        );
        self.set_state(WorkerState::Streaming);

        let mut pending = PendingBatch::new(&self.partition, self.committed);
        let mut recv_failures = 0u32;

        while !self.shutting_down() {
            let timeout = match pending
                .opened_at
                .and_then(|opened| opened.checked_add(self.ctx.config.batch_wait))
            {
                Some(close_at) => close_at
                    .saturating_duration_since(Instant::now())
                    .min(self.ctx.config.poll_timeout),
                None => self.ctx.config.poll_timeout,
            };

            match stream.recv(timeout).await {
                Ok(Some(event)) => {
                    recv_failures = 0;
                    if let Some(blocked) = self.ingest(event, &mut pending).await? {
                        self.flush(&mut *stream, &mut pending).await?;
                        if !self.block(&mut *stream, &mut pending, blocked).await? {
                            break;
                        }
                        continue;
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    recv_failures += 1;
                    self.metrics.retry();
                    if self.ctx.config.retry.exhausted(recv_failures) {
                        return Err(WorkerError::Transport {
                            partition: self.partition.clone(),
                            source: e,
                        });
                    }
                    let delay = self.ctx.config.retry.delay(recv_failures);
                    tracing::warn!(
                        "Receive on {} failed (attempt {}): {}. Retrying in {:?}",
                        self.partition,
                        recv_failures,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(WorkerError::Transport {
                        partition: self.partition.clone(),
                        source: e,
                    })
                }
            }

            let full = pending.events >= self.ctx.config.batch_size.max(1);
            let expired = pending
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.ctx.config.batch_wait);
            if full || expired {
                self.flush(&mut *stream, &mut pending).await?;
            }
        }

        self.set_state(WorkerState::Draining);
        if !pending.is_empty() {
            tracing::info!(
                "Draining {} in-flight events on {}",
                pending.events,
                self.partition
            );
            self.flush(&mut *stream, &mut pending).await?;
        }
        Ok(())
    }

    async fn read_committed(&self) -> Result<Option<SourcePosition>, WorkerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ctx.target.committed_position(&self.partition).await {
                Ok(position) => return Ok(position),
                Err(e @ (LedgerError::Unavailable(_) | LedgerError::Postgres(_)))
                    if !self.ctx.config.retry.exhausted(attempt) =>
                {
                    let delay = self.ctx.config.retry.delay(attempt);
                    tracing::warn!(
                        "Reading ledger for {} failed (attempt {}): {}. Retrying in {:?}",
                        self.partition,
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(WorkerError::Ledger {
                        partition: self.partition.clone(),
                        source: e,
                    })
                }
            }
        }
    }

    async fn open_stream(&self) -> Result<Box<dyn PartitionStream>, WorkerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .ctx
                .transport
                .open(&self.partition, self.committed)
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() && !self.ctx.config.retry.exhausted(attempt) => {
                    let delay = self.ctx.config.retry.delay(attempt);
                    tracing::warn!(
                        "Opening {} failed (attempt {}): {}. Retrying in {:?}",
                        self.partition,
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(WorkerError::Transport {
                        partition: self.partition.clone(),
                        source: e,
                    })
                }
            }
        }
    }

    /// Decode one event into the open batch. Returns the schema change that
    /// must block the partition, if any.
    async fn ingest(
        &self,
        event: RawEvent,
        pending: &mut PendingBatch,
    ) -> Result<Option<Blocked>, WorkerError> {
        self.metrics.event();
        if self.committed.is_some_and(|c| event.position <= c) {
            tracing::debug!(
                "Skipping redelivered {}@{} (committed {:?})",
                self.partition,
                event.position,
                self.committed
            );
            self.metrics.skipped();
            return Ok(None);
        }

        match self.ctx.decoder.decode(&event) {
            Ok(Decoded::Record(record)) => {
                pending.push(*record, event.payload);
            }
            Ok(Decoded::Skip { reason }) => {
                tracing::debug!(
                    "Skipping {}@{}: {}",
                    self.partition,
                    event.position,
                    reason
                );
                self.metrics.skipped();
                pending.observe(&self.partition, event.position);
            }
            Ok(Decoded::SchemaChange { table, ddl }) => {
                tracing::warn!(
                    "Schema change on {}@{} (table {:?}): {}",
                    self.partition,
                    event.position,
                    table,
                    ddl.as_deref().unwrap_or("<no ddl>")
                );
                return Ok(Some(Blocked {
                    position: event.position,
                    table,
                }));
            }
            Err(e) => {
                tracing::warn!(
                    "Rejected {}@{}: {}",
                    self.partition,
                    event.position,
                    e
                );
                self.dead_letter(
                    event.position,
                    event.payload.as_deref(),
                    format!("{}: {}", e.kind(), e),
                    FailureKind::Validation,
                    1,
                    Utc::now(),
                )
                .await?;
                pending.observe(&self.partition, event.position);
            }
        }
        Ok(None)
    }

    /// Hold the partition after a schema change until an operator resumes it.
    /// Returns `false` if shutdown arrived first.
    async fn block(
        &mut self,
        stream: &mut dyn PartitionStream,
        pending: &mut PendingBatch,
        blocked: Blocked,
    ) -> Result<bool, WorkerError> {
        self.set_state(WorkerState::Blocked {
            position: blocked.position,
            table: blocked.table.clone(),
        });
        tracing::warn!(
            "Partition {} blocked at {} until resumed by an operator",
            self.partition,
            blocked.position
        );

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = self.resume.notified() => {}
            _ = shutdown.wait_for(|stop| *stop) => return Ok(false),
        }

        tracing::info!(
            "Partition {} resumed past schema change at {}",
            self.partition,
            blocked.position
        );
        pending.observe(&self.partition, blocked.position);
        self.flush(stream, pending).await?;
        self.set_state(WorkerState::Streaming);
        Ok(true)
    }

    /// Apply the open batch until it succeeds, then commit the transport.
    async fn flush(
        &mut self,
        stream: &mut dyn PartitionStream,
        pending: &mut PendingBatch,
    ) -> Result<(), WorkerError> {
        if pending.is_empty() {
            return Ok(());
        }
        let retry = self.ctx.config.retry;
        let mut transient_attempts = 0u32;
        let mut first_failed_at: Option<DateTime<Utc>> = None;
        let mut data_failures: BTreeMap<SourcePosition, (u32, DateTime<Utc>)> = BTreeMap::new();

        loop {
            self.ctx.pause.wait().await;
            let outcome = self.ctx.target.apply_batch(&pending.batch).await;
            match outcome {
                ApplyOutcome::Success(report) => {
                    self.ctx.pause.reset();
                    let delivered = pending.batch.max_position(&self.partition);
                    let committed = report.committed.get(&self.partition).copied().or(delivered);
                    if let Some(position) = committed {
                        self.commit_transport(stream, position).await;
                        self.committed = Some(position);
                        self.ctx.lag.record_committed(&self.partition, position).await;
                    }
                    self.metrics.batch_committed(report.applied);
                    tracing::info!(
                        "Committed {} through {:?}: {} events, {} applied, {} stale, {} collapsed",
                        self.partition,
                        committed,
                        pending.events,
                        report.applied,
                        report.skipped_stale,
                        report.collapsed
                    );
                    *pending = PendingBatch::new(&self.partition, self.committed);
                    return Ok(());
                }
                ApplyOutcome::TransientFailure {
                    systemic: true,
                    reason,
                    ..
                } => {
                    self.metrics.retry();
                    self.ctx.pause.trip(&reason);
                }
                ApplyOutcome::TransientFailure {
                    record,
                    reason,
                    systemic: false,
                } => {
                    transient_attempts += 1;
                    self.metrics.retry();
                    let first = *first_failed_at.get_or_insert_with(Utc::now);
                    if retry.exhausted(transient_attempts) {
                        let Some(record) = record else {
                            return Err(WorkerError::RetriesExhausted {
                                partition: self.partition.clone(),
                                attempts: transient_attempts,
                                reason,
                            });
                        };
                        tracing::warn!(
                            "Giving up on {} after {} transient failures: {}",
                            record,
                            transient_attempts,
                            reason
                        );
                        let payload = pending.extract(&record);
                        self.dead_letter(
                            record.position,
                            payload.as_deref(),
                            reason,
                            FailureKind::RetriesExhausted,
                            transient_attempts,
                            first,
                        )
                        .await?;
                        transient_attempts = 0;
                        first_failed_at = None;
                        continue;
                    }
                    let delay = retry.delay(transient_attempts);
                    tracing::warn!(
                        "Apply on {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        self.partition,
                        transient_attempts,
                        retry.max_attempts,
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                ApplyOutcome::PermanentFailure { record, reason } => {
                    self.metrics.retry();
                    let entry = data_failures
                        .entry(record.position)
                        .or_insert((0, Utc::now()));
                    entry.0 += 1;
                    let (failures, first) = *entry;
                    if failures >= self.ctx.config.data_error_attempts.max(1) {
                        tracing::warn!(
                            "Dead-lettering {} after {} data errors: {}",
                            record,
                            failures,
                            reason
                        );
                        let payload = pending.extract(&record);
                        self.dead_letter(
                            record.position,
                            payload.as_deref(),
                            reason,
                            FailureKind::PersistentData,
                            failures,
                            first,
                        )
                        .await?;
                        continue;
                    }
                    let delay = retry.delay(failures);
                    tracing::warn!(
                        "Data error at {} (failure {}/{}): {}. Retrying in {:?}",
                        record,
                        failures,
                        self.ctx.config.data_error_attempts,
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                ApplyOutcome::LedgerInconsistency {
                    partition,
                    ledger,
                    expected,
                    reason,
                } => {
                    tracing::error!(
                        "Ledger inconsistency on {}: ledger holds {:?}, worker expected {:?}. Manual repair required",
                        partition,
                        ledger,
                        expected
                    );
                    return Err(WorkerError::LedgerInconsistency {
                        partition,
                        ledger,
                        expected,
                        reason,
                    });
                }
            }
        }
    }

    /// The ledger is authoritative; a failed transport commit only means the
    /// batch is redelivered and skipped after a restart.
    async fn commit_transport(&self, stream: &mut dyn PartitionStream, position: SourcePosition) {
        if let Err(e) = stream.commit(position).await {
            tracing::warn!(
                "Transport commit of {}@{} failed: {}",
                self.partition,
                position,
                e
            );
        }
    }

    /// Write a dead letter, retrying the sink. Never returns `Ok` unless the
    /// record landed.
    async fn dead_letter(
        &self,
        position: SourcePosition,
        payload: Option<&[u8]>,
        reason: String,
        kind: FailureKind,
        attempt_count: u32,
        first_failed_at: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        let retry = self.ctx.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = Failure {
                partition: &self.partition,
                position,
                payload,
                reason: reason.clone(),
                kind,
                attempt_count,
                first_failed_at,
            };
            match self.ctx.router.route(failure).await {
                Ok(Some(_)) => {
                    self.metrics.dead_letter();
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Err(e) if !retry.exhausted(attempt) => {
                    let delay = retry.delay(attempt);
                    tracing::warn!(
                        "Dead-letter write for {}@{} failed (attempt {}): {}. Retrying in {:?}",
                        self.partition,
                        position,
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(WorkerError::DeadLetterUnavailable {
                        partition: self.partition.clone(),
                        position,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

struct Blocked {
    position: SourcePosition,
    table: Option<String>,
}
