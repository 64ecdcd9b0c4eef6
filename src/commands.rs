//! Implementations of the `run`, `init` and `offsets` subcommands.

use std::sync::Arc;

use anyhow::Context;
use change_decoder::ChangeDecoder;
use dead_letter::{DeadLetterRouter, DeadLetterSink, JsonlDeadLetterSink, MemoryDeadLetterSink};
use kafka_source::{KafkaConfig, KafkaDeadLetterSink, KafkaTransport};
use offset_ledger::OffsetLedger;
use pipeline::{Coordinator, PipelineConfig, RetryPolicy, RunSummary};
use postgres_sink::{init_schema, PgPool, PostgresDeadLetterSink, PostgresTarget};
use target_sink::{MemoryTarget, TargetStore};
use tracing::{info, warn};

use crate::config::{format_duration, DeadLetterDestination, FileConfig};
use crate::control_server::ControlServer;
use crate::shutdown::wait_for_shutdown_signal;
use crate::{InitArgs, OffsetsArgs, RunArgs};

/// Consume until SIGINT/SIGTERM, then drain and report.
pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let file_config = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let config = args.pipeline.to_config()?;
    let mut kafka_config = args.kafka.to_config();
    if args.dry_run {
        // Keep a dry run from moving the real consumer group forward
        kafka_config.group_id = format!("{}-dry-run", kafka_config.group_id);
    }
    log_effective_config(&args, &kafka_config, &config, &file_config);

    let transport =
        Arc::new(KafkaTransport::new(kafka_config.clone()).context("Failed to create Kafka transport")?);

    let (target, pool): (Arc<dyn TargetStore>, Option<PgPool>) = if args.dry_run {
        warn!("Dry run: changes are applied to an in-memory target and discarded on exit");
        let target: Arc<dyn TargetStore> = Arc::new(MemoryTarget::new());
        (target, None)
    } else {
        let pool = PgPool::new(args.target.pool_config(config.retry));
        let target = PostgresTarget::new(pool.clone(), args.target.target_schema.clone());
        target
            .init()
            .await
            .context("Failed to prepare the offset ledger")?;
        let target: Arc<dyn TargetStore> = Arc::new(target);
        (target, Some(pool))
    };

    let sink = dead_letter_sink(
        &args.dead_letters,
        pool.as_ref(),
        &args.target.target_schema,
        &kafka_config,
    )
    .await?;
    let router = Arc::new(DeadLetterRouter::new(sink));

    let coordinator = Coordinator::new(
        transport,
        target,
        ChangeDecoder::new(file_config.decoder),
        router,
        config,
    );

    let server = ControlServer::bind(&args.control_listen).await?;
    info!("Control endpoint listening on http://{}", server.local_addr()?);
    let server_task = tokio::spawn(server.serve(coordinator.control()));

    let summary = coordinator
        .run(wait_for_shutdown_signal())
        .await
        .context("Failed to start partition workers")?;
    server_task.abort();

    check_summary(&summary)
}

fn check_summary(summary: &RunSummary) -> anyhow::Result<()> {
    let halted: Vec<String> = summary
        .halted()
        .map(|(partition, reason)| format!("{partition}: {reason}"))
        .collect();
    if !halted.is_empty() {
        anyhow::bail!(
            "{} partition(s) halted:\n  {}",
            halted.len(),
            halted.join("\n  ")
        );
    }
    Ok(())
}

async fn dead_letter_sink(
    destination: &DeadLetterDestination,
    pool: Option<&PgPool>,
    schema: &str,
    kafka: &KafkaConfig,
) -> anyhow::Result<Arc<dyn DeadLetterSink>> {
    let sink: Arc<dyn DeadLetterSink> = match (destination, pool) {
        (DeadLetterDestination::File(path), _) => Arc::new(JsonlDeadLetterSink::new(path)),
        (DeadLetterDestination::Topic(topic), _) => Arc::new(
            KafkaDeadLetterSink::new(&kafka.brokers, topic)
                .context("Failed to create dead-letter producer")?,
        ),
        (DeadLetterDestination::Table, Some(pool)) => {
            let sink = PostgresDeadLetterSink::new(pool.clone(), schema);
            sink.ensure_table().await?;
            Arc::new(sink)
        }
        (DeadLetterDestination::Table, None) => {
            warn!("Dry run: dead letters are kept in memory instead of the target table");
            Arc::new(MemoryDeadLetterSink::new())
        }
    };
    Ok(sink)
}

fn log_effective_config(
    args: &RunArgs,
    kafka: &KafkaConfig,
    config: &PipelineConfig,
    file_config: &FileConfig,
) {
    info!("Starting cdc-migrate{}", if args.dry_run { " (dry run)" } else { "" });
    info!(
        "Kafka: brokers={} group={} topics={:?} prefix={:?}",
        kafka.brokers, kafka.group_id, kafka.topics, kafka.topic_prefix
    );
    info!(
        "Target: {} schema={} pool_size={}",
        args.target.redacted(),
        args.target.target_schema,
        args.target.target_pool_size
    );
    info!(
        "Batching: size={} wait={} poll_timeout={}",
        config.batch_size,
        format_duration(config.batch_wait),
        format_duration(config.poll_timeout)
    );
    info!(
        "Retries: max_attempts={} base={} max={} data_error_attempts={} max_pause={}",
        config.retry.max_attempts,
        format_duration(config.retry.base_delay),
        format_duration(config.retry.max_delay),
        config.data_error_attempts,
        format_duration(config.max_pause)
    );
    info!(
        "Cutover: lag_poll={} dwell={} shutdown_deadline={}",
        format_duration(config.lag_poll_interval),
        format_duration(config.dwell),
        format_duration(config.shutdown_deadline)
    );
    let decoder = &file_config.decoder;
    info!(
        "Decoder: default_key={} explicit_keys={} schema_versions={}..={}",
        decoder.default_key_column,
        decoder.key_columns.len(),
        decoder.min_schema_version,
        decoder.max_schema_version
    );
    info!("Dead letters: {}", args.dead_letters);
}

/// Create the offset ledger and dead-letter tables.
pub async fn init(args: InitArgs) -> anyhow::Result<()> {
    info!(
        "Initializing schema {} on {}",
        args.target.target_schema,
        args.target.redacted()
    );
    let pool = PgPool::new(args.target.pool_config(RetryPolicy::default()));
    init_schema(&pool, &args.target.target_schema).await?;
    info!("Offset ledger and dead-letter tables are ready");
    Ok(())
}

/// Print the committed position of every partition.
pub async fn offsets(args: OffsetsArgs) -> anyhow::Result<()> {
    let pool = PgPool::new(args.target.pool_config(RetryPolicy::default()));
    let target = PostgresTarget::new(pool, args.target.target_schema.clone());
    let records = target
        .read_all_offsets()
        .await
        .context("Failed to read the offset ledger")?;

    if args.json {
        for record in &records {
            println!("{}", serde_json::to_string(record)?);
        }
        return Ok(());
    }
    if records.is_empty() {
        println!("No offsets committed yet");
        return Ok(());
    }
    println!("{:<40} {:>20}  UPDATED AT", "PARTITION", "COMMITTED");
    for record in &records {
        println!(
            "{:<40} {:>20}  {}",
            record.partition.to_string(),
            record.committed_position.to_string(),
            record.updated_at.to_rfc3339()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{MetricsSnapshot, WorkerOutcome, WorkerSummary};
    use std::collections::BTreeMap;

    fn summary(workers: Vec<(&str, WorkerOutcome)>) -> RunSummary {
        RunSummary {
            workers: workers
                .into_iter()
                .map(|(p, o)| (p.parse().unwrap(), o))
                .collect::<BTreeMap<_, _>>(),
            totals: MetricsSnapshot::default(),
            dead_letters: 0,
        }
    }

    #[test]
    fn test_check_summary_passes_when_every_partition_stopped() {
        let s = summary(vec![(
            "cdc.public.users[0]",
            WorkerOutcome::Stopped(WorkerSummary {
                partition: "cdc.public.users[0]".parse().unwrap(),
                committed: None,
            }),
        )]);
        assert!(check_summary(&s).is_ok());
    }

    #[test]
    fn test_check_summary_reports_halted_partitions() {
        let s = summary(vec![
            ("cdc.public.users[0]", WorkerOutcome::Halted("Retries exhausted".into())),
            ("cdc.public.orders[0]", WorkerOutcome::Aborted),
        ]);
        let err = check_summary(&s).unwrap_err().to_string();
        assert!(err.contains("1 partition(s) halted"), "{err}");
        assert!(err.contains("cdc.public.users[0]: Retries exhausted"), "{err}");
    }

    #[tokio::test]
    async fn test_file_dead_letter_sink_from_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead.jsonl");
        let sink = dead_letter_sink(
            &DeadLetterDestination::File(path.clone()),
            None,
            "public",
            &KafkaConfig::default(),
        )
        .await
        .unwrap();
        assert!(sink.describe().contains("dead.jsonl"));
    }

    #[tokio::test]
    async fn test_table_destination_without_pool_falls_back_to_memory() {
        let sink = dead_letter_sink(
            &DeadLetterDestination::Table,
            None,
            "public",
            &KafkaConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(sink.describe(), "memory");
    }
}
