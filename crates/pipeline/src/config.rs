use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff bounds shared by every retry loop in a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before a transient failure is escalated
    pub max_attempts: u32,
    /// Delay after the first failure; doubles per attempt
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Tuning for the partition workers and the lag monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Events per batch before it is closed and applied
    pub batch_size: usize,
    /// Longest time a non-empty batch stays open
    pub batch_wait: Duration,
    /// Upper bound for one transport receive
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
    /// Times a record may fail with a data error before it is dead-lettered
    pub data_error_attempts: u32,
    /// How often source heads are polled and the cutover gate re-evaluated
    pub lag_poll_interval: Duration,
    /// How long every partition must stay at lag 0 before cutover
    pub dwell: Duration,
    /// Workers still running this long after shutdown are aborted
    pub shutdown_deadline: Duration,
    /// Cap for the pipeline-wide pause after systemic target failures
    pub max_pause: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            batch_wait: Duration::from_secs(1),
            poll_timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            data_error_attempts: 3,
            lag_poll_interval: Duration::from_secs(5),
            dwell: Duration::from_secs(30),
            shutdown_deadline: Duration::from_secs(30),
            max_pause: Duration::from_secs(60),
        }
    }
}
