//! Spawns a worker per partition and owns shutdown.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use cdc_core::PartitionId;
use change_decoder::ChangeDecoder;
use dead_letter::DeadLetterRouter;
use target_sink::TargetStore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use transport::{Transport, TransportError};

use crate::config::PipelineConfig;
use crate::control::{ControlHandle, WorkerRegistry};
use crate::error::WorkerError;
use crate::gate::CutoverGate;
use crate::lag::LagMonitor;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pause::PauseGate;
use crate::worker::{PartitionWorker, WorkerContext, WorkerSummary};

/// How one worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Stopped(WorkerSummary),
    Halted(String),
    /// Still running at the shutdown deadline
    Aborted,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub workers: BTreeMap<PartitionId, WorkerOutcome>,
    pub totals: MetricsSnapshot,
    pub dead_letters: u64,
}

impl RunSummary {
    pub fn halted(&self) -> impl Iterator<Item = (&PartitionId, &str)> {
        self.workers.iter().filter_map(|(p, o)| match o {
            WorkerOutcome::Halted(reason) => Some((p, reason.as_str())),
            _ => None,
        })
    }
}

pub struct Coordinator {
    ctx: Arc<WorkerContext>,
    gate: Arc<CutoverGate>,
    workers: Arc<WorkerRegistry>,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        target: Arc<dyn TargetStore>,
        decoder: ChangeDecoder,
        router: Arc<DeadLetterRouter>,
        config: PipelineConfig,
    ) -> Self {
        let pause = Arc::new(PauseGate::new(config.retry.base_delay, config.max_pause));
        let gate = Arc::new(CutoverGate::new(config.dwell));
        let (shutdown, _) = watch::channel(false);
        let ctx = Arc::new(WorkerContext {
            transport,
            target,
            decoder: Arc::new(decoder),
            router,
            pause,
            lag: Arc::new(LagMonitor::new()),
            metrics: Arc::new(Metrics::new()),
            config,
        });
        Self {
            ctx,
            gate,
            workers: Arc::new(WorkerRegistry::default()),
            shutdown,
        }
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            lag: Arc::clone(&self.ctx.lag),
            gate: Arc::clone(&self.gate),
            workers: Arc::clone(&self.workers),
            metrics: Arc::clone(&self.ctx.metrics),
        }
    }

    async fn discover(&self) -> Result<Vec<PartitionId>, TransportError> {
        let retry = self.ctx.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ctx.transport.partitions().await {
                Ok(partitions) => return Ok(partitions),
                Err(e) if e.is_retryable() && !retry.exhausted(attempt) => {
                    let delay = retry.delay(attempt);
                    tracing::warn!(
                        "Partition discovery failed (attempt {}): {}. Retrying in {:?}",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run every partition until `shutdown` resolves or all workers stop.
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunSummary, TransportError> {
        let partitions = self.discover().await?;
        tracing::info!(
            "Starting {} partition workers (target: {}, dead letters: {})",
            partitions.len(),
            self.ctx.target.describe(),
            self.ctx.router.sink_description()
        );

        let mut tasks = JoinSet::new();
        for partition in partitions {
            self.ctx.lag.register(&partition).await;
            let (worker, handle) = PartitionWorker::new(
                partition.clone(),
                Arc::clone(&self.ctx),
                self.shutdown.subscribe(),
            );
            self.workers.insert(handle);
            tasks.spawn(async move { (partition, worker.run().await) });
        }

        let monitor = tokio::spawn(monitor_lag(
            Arc::clone(&self.ctx),
            Arc::clone(&self.gate),
            self.shutdown.subscribe(),
        ));

        let mut outcomes = BTreeMap::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested; draining partition workers");
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(result) => record_outcome(&mut outcomes, result),
                    None => break,
                }
            }
        }
        self.shutdown.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.ctx.config.shutdown_deadline;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(result)) => record_outcome(&mut outcomes, result),
                Ok(None) => break,
                Err(_) => {
                    let lingering: Vec<String> = self
                        .workers
                        .states()
                        .into_iter()
                        .filter(|(_, state)| !state.is_terminal())
                        .map(|(p, state)| format!("{p} ({state})"))
                        .collect();
                    tracing::error!(
                        "Shutdown deadline of {:?} passed; aborting partitions that did not stop: {}",
                        self.ctx.config.shutdown_deadline,
                        lingering.join(", ")
                    );
                    tasks.abort_all();
                    while let Some(result) = tasks.join_next().await {
                        record_outcome(&mut outcomes, result);
                    }
                    break;
                }
            }
        }
        for partition in self.workers.states().into_keys() {
            outcomes.entry(partition).or_insert(WorkerOutcome::Aborted);
        }

        if let Err(e) = monitor.await {
            tracing::warn!("Lag monitor task failed: {e}");
        }

        let summary = RunSummary {
            workers: outcomes,
            totals: self.ctx.metrics.totals(),
            dead_letters: self.ctx.router.total().await,
        };
        log_summary(&self.ctx, &summary);
        Ok(summary)
    }
}

fn record_outcome(
    outcomes: &mut BTreeMap<PartitionId, WorkerOutcome>,
    result: Result<
        (PartitionId, Result<WorkerSummary, WorkerError>),
        tokio::task::JoinError,
    >,
) {
    match result {
        Ok((partition, Ok(summary))) => {
            outcomes.insert(partition, WorkerOutcome::Stopped(summary));
        }
        Ok((partition, Err(e))) => {
            outcomes.insert(partition, WorkerOutcome::Halted(e.to_string()));
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!("Partition worker panicked: {e}"),
    }
}

/// Poll source heads, log lag, and feed the cutover gate until shutdown.
async fn monitor_lag(
    ctx: Arc<WorkerContext>,
    gate: Arc<CutoverGate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(ctx.config.lag_poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => return,
        }
        ctx.lag.poll_heads(ctx.transport.as_ref()).await;
        let snapshots = ctx.lag.snapshots().await;
        for snapshot in &snapshots {
            tracing::info!(
                partition = %snapshot.partition,
                lag = snapshot.lag_events,
                head = ?snapshot.source_head_position,
                committed = ?snapshot.committed_position,
                "Replication lag"
            );
        }
        if ctx.lag.fully_observed().await {
            gate.observe(&snapshots, tokio::time::Instant::now());
        }
    }
}

fn log_summary(ctx: &WorkerContext, summary: &RunSummary) {
    for (partition, metrics) in ctx.metrics.snapshot() {
        let outcome = match summary.workers.get(&partition) {
            Some(WorkerOutcome::Stopped(s)) => format!("stopped at {:?}", s.committed),
            Some(WorkerOutcome::Halted(reason)) => format!("halted: {reason}"),
            Some(WorkerOutcome::Aborted) | None => "aborted".to_string(),
        };
        tracing::info!(
            partition = %partition,
            events = metrics.events,
            applied = metrics.applied,
            batches = metrics.batches,
            retries = metrics.retries,
            dead_letters = metrics.dead_letters,
            "Partition summary: {outcome}"
        );
    }
    let totals = summary.totals;
    tracing::info!(
        "Run complete: {} events, {} applied, {} batches, {} retries, {} dead letters",
        totals.events,
        totals.applied,
        totals.batches,
        totals.retries,
        summary.dead_letters
    );
}
