//! cdc-migrate - replicate CDC change streams into PostgreSQL
//!
//! Consumes Debezium change events from Kafka, applies them idempotently to a
//! PostgreSQL target with an offset ledger kept in the same transaction, and
//! gates the final cutover on every partition reaching zero lag.
//!
//! The pipeline itself lives in the workspace crates; this crate holds the
//! command-line surface, configuration loading and the operator control
//! endpoint.

use std::time::Duration;

use clap::Parser;
use kafka_source::KafkaConfig;
use pipeline::{PipelineConfig, RetryPolicy};
use postgres_sink::PoolConfig;

pub mod commands;
pub mod config;
pub mod control_server;
pub mod shutdown;

use config::{parse_duration, redact_connection_string, DeadLetterDestination};

/// Kafka connection options
#[derive(Parser, Clone, Debug)]
pub struct KafkaOpts {
    /// Kafka bootstrap servers (comma-separated)
    #[arg(long, default_value = "localhost:9092", env = "KAFKA_BOOTSTRAP")]
    pub kafka_bootstrap: String,

    /// Consumer group used for Kafka-side offset commits
    #[arg(long, default_value = "cdc-consumer-group", env = "KAFKA_GROUP_ID")]
    pub kafka_group_id: String,

    /// Explicit topics to consume (comma-separated)
    #[arg(long, value_delimiter = ',', env = "KAFKA_TOPICS")]
    pub kafka_topics: Vec<String>,

    /// Consume every topic starting with this prefix (empty to disable)
    #[arg(long, default_value = "cdc.public.", env = "KAFKA_TOPIC_PREFIX")]
    pub kafka_topic_prefix: String,

    /// Consumer session timeout in milliseconds
    #[arg(long, default_value = "30000", env = "KAFKA_SESSION_TIMEOUT_MS")]
    pub kafka_session_timeout_ms: String,

    /// Timeout for metadata and watermark requests
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub kafka_metadata_timeout: Duration,
}

impl KafkaOpts {
    pub fn to_config(&self) -> KafkaConfig {
        let prefix = self.kafka_topic_prefix.trim();
        KafkaConfig {
            brokers: self.kafka_bootstrap.clone(),
            group_id: self.kafka_group_id.clone(),
            topics: self
                .kafka_topics
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            topic_prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
            session_timeout_ms: self.kafka_session_timeout_ms.clone(),
            metadata_timeout: self.kafka_metadata_timeout,
        }
    }
}

/// Target PostgreSQL options
#[derive(Parser, Clone, Debug)]
pub struct TargetOpts {
    /// Full connection string; overrides the individual host/port/... options
    #[arg(long, env = "TARGET_DB_URL", hide_env_values = true)]
    pub target_url: Option<String>,

    #[arg(long, default_value = "localhost", env = "TARGET_DB_HOST")]
    pub target_host: String,

    #[arg(long, default_value = "5433", env = "TARGET_DB_PORT")]
    pub target_port: u16,

    #[arg(long, default_value = "targetdb", env = "TARGET_DB_NAME")]
    pub target_database: String,

    #[arg(long, default_value = "migration", env = "TARGET_DB_USER")]
    pub target_user: String,

    #[arg(long, env = "TARGET_DB_PASSWORD", hide_env_values = true)]
    pub target_password: Option<String>,

    /// Schema holding the replicated tables, the offset ledger and dead letters
    #[arg(long, default_value = "public", env = "TARGET_SCHEMA")]
    pub target_schema: String,

    /// Maximum number of target connections shared by all partitions
    #[arg(long, default_value = "4", env = "TARGET_POOL_SIZE")]
    pub target_pool_size: usize,
}

impl TargetOpts {
    pub fn connection_string(&self) -> String {
        if let Some(url) = &self.target_url {
            return url.clone();
        }
        let mut conn = format!(
            "host={} port={} dbname={} user={}",
            self.target_host, self.target_port, self.target_database, self.target_user
        );
        if let Some(password) = &self.target_password {
            conn.push_str(&format!(" password={password}"));
        }
        conn
    }

    /// Connection string safe to log.
    pub fn redacted(&self) -> String {
        redact_connection_string(&self.connection_string())
    }

    pub fn pool_config(&self, retry: RetryPolicy) -> PoolConfig {
        PoolConfig {
            url: self.connection_string(),
            size: self.target_pool_size,
            connect_attempts: retry.max_attempts,
            connect_backoff: retry.base_delay,
            max_connect_backoff: retry.max_delay,
        }
    }
}

/// Batching, retry and cutover tuning
#[derive(Parser, Clone, Debug)]
pub struct PipelineOpts {
    /// Events per batch
    #[arg(long, default_value = "100", env = "BATCH_SIZE")]
    pub batch_size: usize,

    /// Longest time a non-empty batch stays open
    #[arg(long, default_value = "1s", env = "BATCH_WAIT", value_parser = parse_duration)]
    pub batch_wait: Duration,

    /// Upper bound for a single poll of the source
    #[arg(long, default_value = "1.0", env = "CONSUMER_POLL_TIMEOUT", value_parser = parse_duration)]
    pub poll_timeout: Duration,

    /// Attempts before a transient failure is escalated
    #[arg(long, default_value = "5", env = "MAX_RETRIES")]
    pub max_retries: u32,

    /// Delay after the first failure; doubles per attempt
    #[arg(long, default_value = "2.0", env = "RETRY_BACKOFF_BASE", value_parser = parse_duration)]
    pub retry_base_delay: Duration,

    /// Upper bound for a single retry delay
    #[arg(long, default_value = "30s", env = "RETRY_BACKOFF_MAX", value_parser = parse_duration)]
    pub retry_max_delay: Duration,

    /// Failed applies of the same record before it is dead-lettered
    #[arg(long, default_value = "3", env = "DATA_ERROR_ATTEMPTS")]
    pub data_error_attempts: u32,

    /// How often source heads are polled for lag
    #[arg(long, default_value = "5s", env = "LAG_POLL_INTERVAL", value_parser = parse_duration)]
    pub lag_poll_interval: Duration,

    /// How long every partition must stay at zero lag before cutover
    #[arg(long, default_value = "30s", env = "CUTOVER_DWELL", value_parser = parse_duration)]
    pub cutover_dwell: Duration,

    /// Workers still running this long after a shutdown signal are aborted
    #[arg(long, default_value = "30s", env = "SHUTDOWN_DEADLINE", value_parser = parse_duration)]
    pub shutdown_deadline: Duration,

    /// Cap for the pipeline-wide pause after systemic target failures
    #[arg(long, default_value = "60s", env = "MAX_PAUSE", value_parser = parse_duration)]
    pub max_pause: Duration,
}

impl PipelineOpts {
    pub fn to_config(&self) -> anyhow::Result<PipelineConfig> {
        if self.batch_size == 0 {
            anyhow::bail!("--batch-size must be at least 1");
        }
        if self.max_retries == 0 {
            anyhow::bail!("--max-retries must be at least 1");
        }
        if self.data_error_attempts == 0 {
            anyhow::bail!("--data-error-attempts must be at least 1");
        }
        Ok(PipelineConfig {
            batch_size: self.batch_size,
            batch_wait: self.batch_wait,
            poll_timeout: self.poll_timeout,
            retry: RetryPolicy {
                max_attempts: self.max_retries,
                base_delay: self.retry_base_delay,
                max_delay: self.retry_max_delay.max(self.retry_base_delay),
            },
            data_error_attempts: self.data_error_attempts,
            lag_poll_interval: self.lag_poll_interval,
            dwell: self.cutover_dwell,
            shutdown_deadline: self.shutdown_deadline,
            max_pause: self.max_pause,
        })
    }
}

/// Options for `cdc-migrate run`
#[derive(Parser, Clone, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub kafka: KafkaOpts,

    #[command(flatten)]
    pub target: TargetOpts,

    #[command(flatten)]
    pub pipeline: PipelineOpts,

    /// Dead-letter destination: file:<path>, table or topic:<name>
    #[arg(long, default_value = "table", env = "DEAD_LETTER_DEST")]
    pub dead_letters: DeadLetterDestination,

    /// Address for the operator control endpoint
    #[arg(long, default_value = "127.0.0.1:8089", env = "CONTROL_LISTEN")]
    pub control_listen: String,

    /// YAML file with per-table key columns and the accepted schema versions
    #[arg(long, env = "CDC_MIGRATE_CONFIG", value_name = "PATH")]
    pub config: Option<std::path::PathBuf>,

    /// Dry run mode - consume and decode, but apply into an in-memory target
    #[arg(long)]
    pub dry_run: bool,
}

/// Options for `cdc-migrate init`
#[derive(Parser, Clone, Debug)]
pub struct InitArgs {
    #[command(flatten)]
    pub target: TargetOpts,
}

/// Options for `cdc-migrate offsets`
#[derive(Parser, Clone, Debug)]
pub struct OffsetsArgs {
    #[command(flatten)]
    pub target: TargetOpts,

    /// Print one JSON document per partition instead of a table
    #[arg(long)]
    pub json: bool,
}
